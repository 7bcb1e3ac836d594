//! LLM collaborator seam (query analysis only)
//!
//! The model is consulted for intent classification and paraphrase
//! generation; its failure is always recoverable upstream.

use crate::analysis::Intent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestError(String),

    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),
}

/// Trait for the analysis LLM
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Classify the question into one of the eight intents
    async fn classify_intent(&self, question: &str) -> Result<(Intent, f32), LlmError>;

    /// Generate up to `n` paraphrases of the question
    async fn paraphrase(&self, question: &str, n: usize) -> Result<Vec<String>, LlmError>;
}

/// Ollama generate-API client
pub struct OllamaLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaLlmClient {
    pub fn new(config: &crate::config::LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    async fn generate(&self, prompt: String) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestError(format!("Ollama HTTP error: {}", e)))?;

        if !response.status().is_success() {
            return Err(LlmError::RequestError(format!(
                "Ollama returned {}",
                response.status()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        Ok(parsed.response.trim().to_string())
    }
}

#[async_trait]
impl LlmClient for OllamaLlmClient {
    async fn classify_intent(&self, question: &str) -> Result<(Intent, f32), LlmError> {
        let prompt = format!(
            "Câu hỏi của người dùng: \"{question}\"\n\n\
             Xác định intent (mục đích) của câu hỏi. Chọn MỘT trong các intent sau:\n\
             - documents: Hỏi về giấy tờ, hồ sơ cần nộp\n\
             - requirements: Hỏi về điều kiện, yêu cầu, đối tượng được làm\n\
             - process: Hỏi về quy trình, trình tự, các bước thực hiện\n\
             - legal: Hỏi về căn cứ pháp lý\n\
             - timeline: Hỏi về thời gian, thời hạn\n\
             - fees: Hỏi về phí, lệ phí\n\
             - location: Hỏi về địa chỉ, địa điểm\n\
             - overview: Hỏi tổng quan về thủ tục\n\n\
             Trả về JSON: {{\"intent\": \"...\", \"confidence\": 0.0-1.0}}\n\
             Chỉ trả về JSON, không giải thích."
        );

        let response = self.generate(prompt).await?;

        // Prefer the JSON object; tolerate a bare intent name
        if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
            #[derive(Deserialize)]
            struct IntentJson {
                intent: String,
                #[serde(default)]
                confidence: Option<f32>,
            }
            if let Ok(parsed) = serde_json::from_str::<IntentJson>(&response[start..=end]) {
                if let Some(intent) = Intent::parse(&parsed.intent) {
                    let confidence = parsed.confidence.unwrap_or(0.7).clamp(0.0, 1.0);
                    return Ok((intent, confidence));
                }
            }
        }

        let bare = response.to_lowercase();
        Intent::parse(bare.trim())
            .map(|intent| (intent, 0.7))
            .ok_or_else(|| LlmError::MalformedResponse(format!("unrecognised intent: {}", response)))
    }

    async fn paraphrase(&self, question: &str, n: usize) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            "Câu hỏi gốc: \"{question}\"\n\n\
             Hãy tạo {n} cách diễn đạt khác của câu hỏi này để tìm kiếm hiệu quả hơn.\n\n\
             Yêu cầu:\n\
             1. Giữ nguyên ý nghĩa của câu hỏi gốc\n\
             2. Sử dụng từ đồng nghĩa\n\
             3. Thay đổi cấu trúc câu\n\n\
             Trả về JSON array: [\"...\", \"...\"]\n\
             Chỉ trả về JSON array, không giải thích."
        );

        let response = self.generate(prompt).await?;

        let (start, end) = match (response.find('['), response.rfind(']')) {
            (Some(s), Some(e)) if e > s => (s, e),
            _ => {
                return Err(LlmError::MalformedResponse(
                    "no JSON array in paraphrase response".to_string(),
                ))
            }
        };

        let variations: Vec<String> = serde_json::from_str(&response[start..=end])
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        Ok(variations
            .into_iter()
            .filter(|v| !v.trim().is_empty())
            .take(n)
            .collect())
    }
}
