//! In-memory Okapi BM25 index over the chunk store
//!
//! Built once at startup as a pure function of the store; the orchestrator
//! must not accept queries before the build completes. Tokenisation is
//! lowercase, split on whitespace and punctuation, with Vietnamese stopwords
//! removed. IDF is clamped at zero.

use crate::store::ChunkStore;
use ahash::AHashMap;
use serde::Serialize;

/// Vietnamese stopwords removed during tokenisation
const VIETNAMESE_STOPWORDS: &[&str] = &[
    "và", "của", "có", "là", "được", "trong", "các", "để", "cho", "với", "theo", "từ", "về",
    "này", "đó", "khi", "như", "không", "tại", "hoặc", "những", "đã", "vào", "nếu", "hay",
    "do", "sẽ", "bởi", "bằng", "đến", "trên", "dưới", "sau", "trước", "ngoài", "giữa", "thì",
    "nhưng", "mà", "vì", "nên", "đây", "đấy", "cũng", "thêm", "nhiều", "ít",
];

/// Posting in the inverted index
#[derive(Debug, Clone, Copy)]
struct Posting {
    doc_id: u32,
    term_freq: u32,
}

/// Index statistics exposed on the stats surface
#[derive(Debug, Clone, Serialize)]
pub struct Bm25Stats {
    pub num_docs: usize,
    pub avg_doc_length: f32,
    pub vocab_size: usize,
    pub k1: f32,
    pub b: f32,
}

/// BM25 index with pre-computed IDF scores
///
/// Documents are addressed by `chunk_id`; the index holds no content, only
/// postings and lengths.
pub struct Bm25Index {
    k1: f32,
    b: f32,
    inverted_index: AHashMap<String, Vec<Posting>>,
    idf: AHashMap<String, f32>,
    doc_lengths: Vec<u32>,
    doc_ids: Vec<String>,
    avg_doc_length: f32,
}

impl Bm25Index {
    /// Build the index from every chunk in the store
    pub fn build(store: &ChunkStore, k1: f32, b: f32) -> Self {
        let mut inverted_index: AHashMap<String, Vec<Posting>> = AHashMap::new();
        let mut doc_lengths = Vec::with_capacity(store.len());
        let mut doc_ids = Vec::with_capacity(store.len());

        for (doc_id, chunk) in store.iter().enumerate() {
            let tokens = tokenize(&chunk.content);
            doc_lengths.push(tokens.len() as u32);
            doc_ids.push(chunk.chunk_id.clone());

            let mut term_freqs: AHashMap<String, u32> = AHashMap::new();
            for token in tokens {
                *term_freqs.entry(token).or_insert(0) += 1;
            }

            for (term, freq) in term_freqs {
                inverted_index.entry(term).or_default().push(Posting {
                    doc_id: doc_id as u32,
                    term_freq: freq,
                });
            }
        }

        let num_docs = doc_ids.len();
        let avg_doc_length = if num_docs > 0 {
            doc_lengths.iter().sum::<u32>() as f32 / num_docs as f32
        } else {
            0.0
        };

        // Pre-compute IDF per term, clamped at zero
        let mut idf = AHashMap::with_capacity(inverted_index.len());
        for (term, postings) in &inverted_index {
            let df = postings.len() as f32;
            let value = ((num_docs as f32 - df + 0.5) / (df + 0.5)).ln().max(0.0);
            idf.insert(term.clone(), value);
        }

        tracing::info!(
            num_docs,
            vocab_size = inverted_index.len(),
            avg_doc_length,
            "BM25 index built"
        );

        Self {
            k1,
            b,
            inverted_index,
            idf,
            doc_lengths,
            doc_ids,
            avg_doc_length,
        }
    }

    /// Search the index, returning `(chunk_id, score)` pairs sorted by score
    /// descending. Only documents with a positive score are returned.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.doc_ids.is_empty() {
            return Vec::new();
        }

        let mut scores: AHashMap<u32, f32> = AHashMap::new();

        for term in &query_terms {
            let Some(postings) = self.inverted_index.get(term) else {
                continue;
            };
            let idf = self.idf[term];
            if idf == 0.0 {
                continue;
            }

            for posting in postings {
                let tf = posting.term_freq as f32;
                let doc_len = self.doc_lengths[posting.doc_id as usize] as f32;

                let numerator = tf * (self.k1 + 1.0);
                let denominator =
                    tf + self.k1 * (1.0 - self.b + self.b * doc_len / self.avg_doc_length);

                *scores.entry(posting.doc_id).or_insert(0.0) += idf * numerator / denominator;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        ranked
            .into_iter()
            .map(|(doc_id, score)| (self.doc_ids[doc_id as usize].clone(), score))
            .collect()
    }

    /// Index statistics
    pub fn stats(&self) -> Bm25Stats {
        Bm25Stats {
            num_docs: self.doc_ids.len(),
            avg_doc_length: self.avg_doc_length,
            vocab_size: self.inverted_index.len(),
            k1: self.k1,
            b: self.b,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }
}

/// Tokenize Vietnamese text: lowercase, split on whitespace and punctuation,
/// keep tokens longer than one character, drop stopwords
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .filter(|token| !VIETNAMESE_STOPWORDS.contains(token))
        .map(|token| token.to_string())
        .collect()
}
