//! Embedding-proxy cross-encoder
//!
//! Ollama has no native rerank API, so relevance is approximated by cosine
//! similarity between the query and each candidate under the reranker
//! embedding model, mapped from [-1, 1] into [0, 1].

use crate::rerank::{CrossEncoder, RerankError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Candidate text is capped before scoring
const MAX_SCORED_CHARS: usize = 512;

pub struct OllamaCrossEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaCrossEncoder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, RerankError> {
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: self.model.clone(),
            input: inputs,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RerankError::RequestError(format!("Ollama HTTP error: {}", e)))?;

        if !response.status().is_success() {
            return Err(RerankError::RequestError(format!(
                "Ollama returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RerankError::RequestError(format!("JSON parse error: {}", e)))?;

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl CrossEncoder for OllamaCrossEncoder {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut inputs = Vec::with_capacity(texts.len() + 1);
        inputs.push(query.to_string());
        inputs.extend(
            texts
                .iter()
                .map(|t| t.chars().take(MAX_SCORED_CHARS).collect::<String>()),
        );

        let embeddings = self.embed(inputs).await?;
        if embeddings.len() != texts.len() + 1 {
            return Err(RerankError::ScoreCountMismatch {
                expected: texts.len() + 1,
                got: embeddings.len(),
            });
        }

        let query_embedding = &embeddings[0];
        let scores = embeddings[1..]
            .iter()
            .map(|e| (raw_cosine(query_embedding, e) + 1.0) / 2.0)
            .collect();

        Ok(scores)
    }
}

/// Unclamped cosine similarity in [-1, 1]
fn raw_cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
