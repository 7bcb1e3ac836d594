//! Reciprocal Rank Fusion across retrieval channels
//!
//! Every ranked list from the dense expansions and the BM25 channel is
//! fused by `RRF(d) = sum(1 / (k + rank))`. BM25 contributions carry an
//! empirical boost; dense candidates outside the parent procedure set carry
//! their cross-tier penalty into the fused contribution instead of being
//! filtered out.

use crate::retrieval::{RetrievalSource, RetrievedItem};
use ahash::{AHashMap, AHashSet};

/// Channel a ranked list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionSource {
    Dense,
    Lexical,
}

/// One candidate within a ranked list, rank implied by position
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub chunk_id: String,
    /// Channel score, already penalised for cross-tier misses
    pub score: f32,
    /// 1.0, or the cross-tier penalty for dense candidates outside the
    /// parent set
    pub penalty: f32,
    pub cross_tier_match: bool,
}

impl FusionCandidate {
    pub fn new(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
            penalty: 1.0,
            cross_tier_match: true,
        }
    }

    pub fn penalised(chunk_id: impl Into<String>, score: f32, penalty: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
            penalty,
            cross_tier_match: false,
        }
    }
}

/// A ranked list entering fusion
#[derive(Debug, Clone)]
pub struct RankedList {
    pub source: FusionSource,
    pub items: Vec<FusionCandidate>,
}

/// Fusion parameters
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// RRF constant (typically 60)
    pub rrf_k: f32,
    /// Multiplier for BM25 contributions
    pub bm25_boost: f32,
}

struct Accumulator {
    rrf_score: f32,
    dense_rank: Option<usize>,
    lexical_rank: Option<usize>,
    dense_score: Option<f32>,
    lexical_score: Option<f32>,
    cross_tier_match: bool,
}

/// Fuse ranked lists into a deduplicated candidate list sorted by RRF score
/// descending, carrying the best rank and score per source
pub fn reciprocal_rank_fusion(lists: &[RankedList], config: &FusionConfig) -> Vec<RetrievedItem> {
    let mut accumulators: AHashMap<String, Accumulator> = AHashMap::new();

    for list in lists {
        for (idx, candidate) in list.items.iter().enumerate() {
            let rank = idx + 1;
            let boost = match list.source {
                FusionSource::Dense => 1.0,
                FusionSource::Lexical => config.bm25_boost,
            };
            let contribution = boost * candidate.penalty / (config.rrf_k + rank as f32);

            let acc = accumulators
                .entry(candidate.chunk_id.clone())
                .or_insert(Accumulator {
                    rrf_score: 0.0,
                    dense_rank: None,
                    lexical_rank: None,
                    dense_score: None,
                    lexical_score: None,
                    cross_tier_match: false,
                });

            acc.rrf_score += contribution;
            match list.source {
                FusionSource::Dense => {
                    acc.dense_rank = Some(acc.dense_rank.map_or(rank, |r| r.min(rank)));
                    acc.dense_score = Some(
                        acc.dense_score
                            .map_or(candidate.score, |s| s.max(candidate.score)),
                    );
                    acc.cross_tier_match |= candidate.cross_tier_match;
                }
                FusionSource::Lexical => {
                    acc.lexical_rank = Some(acc.lexical_rank.map_or(rank, |r| r.min(rank)));
                    acc.lexical_score = Some(
                        acc.lexical_score
                            .map_or(candidate.score, |s| s.max(candidate.score)),
                    );
                }
            }
        }
    }

    let mut fused: Vec<RetrievedItem> = accumulators
        .into_iter()
        .map(|(chunk_id, acc)| RetrievedItem {
            chunk_id,
            score: acc.rrf_score,
            source: RetrievalSource::Fused,
            dense_rank: acc.dense_rank,
            lexical_rank: acc.lexical_rank,
            dense_score: acc.dense_score,
            lexical_score: acc.lexical_score,
            cross_tier_match: acc.cross_tier_match,
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Drop fused candidates whose word set overlaps an already-kept candidate
/// at or above the Jaccard threshold. Items arrive sorted by score, so the
/// higher-scored duplicate always survives.
pub fn remove_near_duplicates<'a>(
    items: Vec<RetrievedItem>,
    content_of: impl Fn(&str) -> Option<&'a str>,
    threshold: f32,
) -> Vec<RetrievedItem> {
    let mut kept: Vec<RetrievedItem> = Vec::with_capacity(items.len());
    let mut kept_words: Vec<AHashSet<String>> = Vec::with_capacity(items.len());

    for item in items {
        let words = match content_of(&item.chunk_id) {
            Some(content) => word_set(content),
            // Unknown content cannot be compared; keep the candidate
            None => {
                kept.push(item);
                kept_words.push(AHashSet::new());
                continue;
            }
        };

        let duplicate = kept_words
            .iter()
            .any(|existing| jaccard(&words, existing) >= threshold);

        if !duplicate {
            kept.push(item);
            kept_words.push(words);
        }
    }

    kept
}

fn word_set(text: &str) -> AHashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect()
}

fn jaccard(a: &AHashSet<String>, b: &AHashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = (a.len() + b.len()) as f32 - intersection;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_list(items: Vec<FusionCandidate>) -> RankedList {
        RankedList {
            source: FusionSource::Dense,
            items,
        }
    }

    fn lexical_list(items: Vec<FusionCandidate>) -> RankedList {
        RankedList {
            source: FusionSource::Lexical,
            items,
        }
    }

    const CONFIG: FusionConfig = FusionConfig {
        rrf_k: 60.0,
        bm25_boost: 1.2,
    };

    #[test]
    fn test_items_in_both_lists_rank_higher() {
        let lists = vec![
            dense_list(vec![
                FusionCandidate::new("a", 0.9),
                FusionCandidate::new("b", 0.8),
                FusionCandidate::new("c", 0.7),
            ]),
            lexical_list(vec![
                FusionCandidate::new("b", 5.0),
                FusionCandidate::new("a", 4.0),
                FusionCandidate::new("d", 3.0),
            ]),
        ];

        let fused = reciprocal_rank_fusion(&lists, &CONFIG);
        assert_eq!(fused.len(), 4);
        assert!(fused[0].chunk_id == "a" || fused[0].chunk_id == "b");
        // Single-list items trail double-list items
        let rank_c = fused.iter().position(|i| i.chunk_id == "c").unwrap();
        assert!(rank_c >= 2);
    }

    #[test]
    fn test_bm25_boost_applied() {
        let lists = vec![
            dense_list(vec![FusionCandidate::new("dense", 0.9)]),
            lexical_list(vec![FusionCandidate::new("lex", 8.0)]),
        ];

        let fused = reciprocal_rank_fusion(&lists, &CONFIG);
        let dense = fused.iter().find(|i| i.chunk_id == "dense").unwrap();
        let lex = fused.iter().find(|i| i.chunk_id == "lex").unwrap();

        // Same rank in their respective lists, so the boost decides
        assert!((lex.score / dense.score - 1.2).abs() < 1e-5);
    }

    #[test]
    fn test_cross_tier_penalty_reduces_fused_score() {
        let in_set = vec![dense_list(vec![FusionCandidate::new("a", 0.9)])];
        let out_of_set = vec![dense_list(vec![FusionCandidate::penalised("a", 0.72, 0.8)])];

        let fused_in = reciprocal_rank_fusion(&in_set, &CONFIG);
        let fused_out = reciprocal_rank_fusion(&out_of_set, &CONFIG);

        // Retained, not filtered, with the fused score reduced by the penalty
        assert_eq!(fused_out.len(), 1);
        assert!((fused_out[0].score / fused_in[0].score - 0.8).abs() < 1e-5);
        assert!(!fused_out[0].cross_tier_match);
        assert!(fused_in[0].cross_tier_match);
    }

    #[test]
    fn test_best_rank_and_score_per_source() {
        let lists = vec![
            dense_list(vec![
                FusionCandidate::new("x", 0.5),
                FusionCandidate::new("a", 0.6),
            ]),
            dense_list(vec![FusionCandidate::new("a", 0.9)]),
        ];

        let fused = reciprocal_rank_fusion(&lists, &CONFIG);
        let a = fused.iter().find(|i| i.chunk_id == "a").unwrap();
        assert_eq!(a.dense_rank, Some(1));
        assert_eq!(a.dense_score, Some(0.9));
        assert!(a.lexical_rank.is_none());
    }

    #[test]
    fn test_deduplication_by_chunk_id() {
        let lists = vec![
            dense_list(vec![FusionCandidate::new("a", 0.9)]),
            dense_list(vec![FusionCandidate::new("a", 0.8)]),
            lexical_list(vec![FusionCandidate::new("a", 3.0)]),
        ];

        let fused = reciprocal_rank_fusion(&lists, &CONFIG);
        assert_eq!(fused.len(), 1);
    }

    #[test]
    fn test_near_duplicate_removal() {
        let items = vec![
            RetrievedItem {
                chunk_id: "a".to_string(),
                score: 0.9,
                source: RetrievalSource::Fused,
                dense_rank: Some(1),
                lexical_rank: None,
                dense_score: Some(0.9),
                lexical_score: None,
                cross_tier_match: true,
            },
            RetrievedItem {
                chunk_id: "b".to_string(),
                score: 0.8,
                source: RetrievalSource::Fused,
                dense_rank: Some(2),
                lexical_rank: None,
                dense_score: Some(0.8),
                lexical_score: None,
                cross_tier_match: true,
            },
            RetrievedItem {
                chunk_id: "c".to_string(),
                score: 0.7,
                source: RetrievalSource::Fused,
                dense_rank: Some(3),
                lexical_rank: None,
                dense_score: Some(0.7),
                lexical_score: None,
                cross_tier_match: true,
            },
        ];

        let content = |id: &str| match id {
            "a" => Some("giấy tờ đăng ký kết hôn gồm chứng minh thư và hộ khẩu"),
            // Identical word set as "a"
            "b" => Some("hộ khẩu và chứng minh thư gồm giấy tờ đăng ký kết hôn"),
            "c" => Some("lệ phí đăng ký kinh doanh theo quy định hiện hành"),
            _ => None,
        };

        let kept = remove_near_duplicates(items, content, 0.95);
        let ids: Vec<&str> = kept.iter().map(|i| i.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_jaccard() {
        let a = word_set("một hai ba");
        let b = word_set("một hai ba");
        let c = word_set("bốn năm sáu");
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &c), 0.0);
    }
}
