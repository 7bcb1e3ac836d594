//! Context assembly
//!
//! Turns the reranked chunk list into a single citable text block under the
//! intent's budget: top procedures, capped descendants per procedure,
//! bounded sibling carry-over from other surfaced procedures, and head/tail
//! truncation of oversized chunks. Every block names its `chunk_id` so
//! generated output can be cited back to the source.

use crate::analysis::ContextConfig;
use crate::retrieval::ScoredChunk;
use crate::store::{ChunkStore, ChunkTier};
use ahash::AHashSet;
use std::sync::Arc;

/// Marker spliced into truncated chunks
const TRUNCATION_MARKER: &str = "\n\n[... Nội dung quá dài, đã rút gọn ...]\n\n";

const SECTION_RULE: &str =
    "================================================================================";

/// Confidence multiplier applied when a retrieval channel failed
const DEGRADED_CONFIDENCE_SCALE: f32 = 0.9;

/// Assembled context with its confidence and the retained chunks
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub context: String,
    pub confidence: f32,
    pub chunks: Vec<ScoredChunk>,
}

pub struct ContextAssembler {
    store: Arc<ChunkStore>,
    max_chunk_tokens: usize,
}

impl ContextAssembler {
    pub fn new(store: Arc<ChunkStore>, max_chunk_tokens: usize) -> Self {
        Self {
            store,
            max_chunk_tokens,
        }
    }

    /// Assemble the context block from the reranked list under the intent
    /// budget. `degraded` scales the confidence down.
    pub fn assemble(
        &self,
        reranked: &[ScoredChunk],
        config: &ContextConfig,
        degraded: bool,
    ) -> AssembledContext {
        // Parents surfacing in the reranked list are overview material, not
        // budgeted descendants
        let children: Vec<&ScoredChunk> = reranked
            .iter()
            .filter(|c| c.chunk.tier == ChunkTier::Child)
            .collect();

        // Group by procedure, preserving the reranked (score-descending)
        // order within and across groups
        let mut procedure_order: Vec<String> = Vec::new();
        let mut groups: ahash::AHashMap<String, Vec<&ScoredChunk>> = ahash::AHashMap::new();
        for chunk in &children {
            let procedure_id = chunk.chunk.procedure_id.clone();
            if !groups.contains_key(&procedure_id) {
                procedure_order.push(procedure_id.clone());
            }
            groups.entry(procedure_id).or_default().push(chunk);
        }

        let top_procedures: Vec<&String> = procedure_order.iter().take(config.chunks).collect();
        let top_set: AHashSet<&str> = top_procedures.iter().map(|p| p.as_str()).collect();

        let mut blocks: Vec<String> = Vec::new();
        let mut retained: Vec<ScoredChunk> = Vec::new();
        let mut block_no = 0usize;

        for procedure_id in &top_procedures {
            let group = &groups[procedure_id.as_str()];
            let selected = &group[..group.len().min(config.max_descendants)];

            let parent = if config.include_parents {
                self.store.parent_of(procedure_id)
            } else {
                None
            };

            for (i, scored) in selected.iter().enumerate() {
                block_no += 1;
                let chunk = &scored.chunk;

                let mut block = format!(
                    "{rule}\n[CHUNK {n} | {id}] THỦ TỤC: {name}\nMã: {code} | Lĩnh vực: {domain}\nLoại: {kind} | Điểm: {score:.4}\n{rule}\n\n",
                    rule = SECTION_RULE,
                    n = block_no,
                    id = chunk.chunk_id,
                    name = display_or_na(&chunk.metadata.procedure_name),
                    code = display_or_na(&chunk.metadata.procedure_code),
                    domain = display_or_na(&chunk.metadata.domain),
                    kind = chunk.chunk_type.as_str(),
                    score = scored.score,
                );

                if i == 0 {
                    if let Some(parent) = parent {
                        block.push_str("[OVERVIEW]\n");
                        block.push_str(&self.truncate_if_needed(&parent.content));
                        block.push_str("\n\n");
                    }
                }

                block.push_str("[DETAILED INFO]\n");
                block.push_str(&self.truncate_if_needed(&chunk.content));
                block.push('\n');

                blocks.push(block);
                retained.push((*scored).clone());
            }
        }

        // Sibling carry-over: the best chunk of each surfaced procedure that
        // did not make the top set
        if config.max_siblings > 0 {
            let mut siblings: Vec<&ScoredChunk> = Vec::new();
            for procedure_id in &procedure_order {
                if top_set.contains(procedure_id.as_str()) {
                    continue;
                }
                if let Some(best) = groups[procedure_id.as_str()].first() {
                    siblings.push(best);
                }
                if siblings.len() >= config.max_siblings {
                    break;
                }
            }

            for scored in siblings {
                block_no += 1;
                let chunk = &scored.chunk;
                let block = format!(
                    "{rule}\n[RELATED CHUNK {n} | {id}] THỦ TỤC: {name}\nMã: {code} | Lĩnh vực: {domain}\nLoại: {kind} | Điểm: {score:.4}\n{rule}\n\n[RELATED INFO]\n{content}\n",
                    rule = SECTION_RULE,
                    n = block_no,
                    id = chunk.chunk_id,
                    name = display_or_na(&chunk.metadata.procedure_name),
                    code = display_or_na(&chunk.metadata.procedure_code),
                    domain = display_or_na(&chunk.metadata.domain),
                    kind = chunk.chunk_type.as_str(),
                    score = scored.score,
                    content = self.truncate_if_needed(&chunk.content),
                );

                blocks.push(block);
                retained.push(scored.clone());
            }
        }

        let confidence = confidence_of(&retained, degraded);

        AssembledContext {
            context: blocks.join("\n"),
            confidence,
            chunks: retained,
        }
    }

    /// Keep the first and last half of the word sequence when a chunk
    /// exceeds the per-chunk token limit
    fn truncate_if_needed(&self, content: &str) -> String {
        let words: Vec<&str> = content.split_whitespace().collect();
        if words.len() <= self.max_chunk_tokens {
            return content.to_string();
        }

        let half = self.max_chunk_tokens / 2;
        let head = words[..half].join(" ");
        let tail = words[words.len() - half..].join(" ");
        tracing::debug!(
            from = words.len(),
            to = self.max_chunk_tokens,
            "Truncated oversized chunk"
        );
        format!("{}{}{}", head, TRUNCATION_MARKER, tail)
    }
}

/// Mean retained score clamped to [0, 1], scaled down on degraded results
fn confidence_of(retained: &[ScoredChunk], degraded: bool) -> f32 {
    if retained.is_empty() {
        return 0.0;
    }

    let mean = retained.iter().map(|c| c.score).sum::<f32>() / retained.len() as f32;
    let mut confidence = mean.clamp(0.0, 1.0);
    if degraded {
        confidence *= DEGRADED_CONFIDENCE_SCALE;
    }
    confidence
}

fn display_or_na(value: &str) -> &str {
    if value.is_empty() {
        "N/A"
    } else {
        value
    }
}
