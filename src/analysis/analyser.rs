//! Query analyser: intent detection, code extraction, query expansion
//!
//! Converts a raw question into a `QueryPlan` that downstream stages consume
//! without re-parsing the text. Intent is resolved by weighted keyword
//! matching first; the LLM is only consulted when no keyword matches, and
//! its failure always degrades to the overview intent.

use crate::analysis::{context_config_for, Intent, QueryPlan};
use crate::error::{Result, ThutucError};
use crate::llm::LlmClient;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Procedure code pattern (e.g. 1.013124, 2.002767)
const PROCEDURE_CODE_PATTERN: &str = r"\b\d+\.\d{5,7}\b";

/// Keyword table per intent; first match set wins on score
const INTENT_KEYWORDS: &[(Intent, &[&str])] = &[
    (
        Intent::Documents,
        &[
            "giấy tờ cần nộp",
            "hồ sơ bao gồm",
            "văn bản nộp",
            "tài liệu cần",
            "nộp gì",
            "giấy tờ gì",
            "giấy tờ nào",
            "cần giấy tờ",
        ],
    ),
    (
        Intent::Requirements,
        &[
            "điều kiện",
            "yêu cầu",
            "ai được",
            "đối tượng",
            "được làm",
            "được phép",
        ],
    ),
    (
        Intent::Process,
        &[
            "trình tự",
            "các bước",
            "làm thế nào",
            "quy trình",
            "cách thức",
        ],
    ),
    (
        Intent::Legal,
        &[
            "căn cứ",
            "pháp lý",
            "luật",
            "nghị định",
            "thông tư",
            "quy định",
        ],
    ),
    (
        Intent::Timeline,
        &[
            "thời gian",
            "bao lâu",
            "thời hạn",
            "mất bao lâu",
            "trong vòng",
            "ngày làm việc",
        ],
    ),
    (
        Intent::Fees,
        &["phí", "lệ phí", "chi phí", "tốn", "giá", "mất bao nhiêu"],
    ),
    (
        Intent::Location,
        &["ở đâu", "địa chỉ", "nơi", "cơ quan nào", "đến đâu"],
    ),
];

/// Keywords that disqualify an intent despite a keyword hit; compound
/// questions mentioning documents but asking about timing go elsewhere
const INTENT_EXCLUSIONS: &[(Intent, &[&str])] = &[(
    Intent::Documents,
    &[
        "thời gian",
        "bao lâu",
        "thời hạn",
        "hình thức thông báo",
        "thông báo",
    ],
)];

/// Fixed synonym substitution table for expansion variants
const SYNONYMS: &[(&str, &[&str])] = &[
    ("đăng ký", &["đk", "ghi danh"]),
    ("giấy tờ", &["hồ sơ", "tài liệu"]),
    ("lệ phí", &["phí", "chi phí"]),
    ("cơ quan", &["nơi", "địa điểm"]),
];

/// Hard cap on the expansion list
const MAX_EXPANSIONS: usize = 5;
/// Paraphrases requested from the LLM
const NUM_PARAPHRASES: usize = 3;
/// Synonym-substituted variants generated from the table
const NUM_SYNONYM_VARIANTS: usize = 2;

pub struct QueryAnalyser {
    llm: Arc<dyn LlmClient>,
    llm_timeout: Duration,
    code_pattern: Regex,
    filler_patterns: Vec<Regex>,
}

impl QueryAnalyser {
    pub fn new(llm: Arc<dyn LlmClient>, llm_timeout: Duration) -> Result<Self> {
        let code_pattern = Regex::new(PROCEDURE_CODE_PATTERN)
            .map_err(|e| ThutucError::Config(format!("Invalid code pattern: {}", e)))?;

        let filler_patterns = [
            r"(?i)^nếu\s+(tôi|mình|em)\s+",
            r"(?i)\s+thì\s+",
            r"(?i)(khác\s+gì|khác\s+nhau\s+như\s+thế\s+nào|sự\s+khác\s+biệt)",
            r"(?i)(bằng\s+cách\s+nào|như\s+thế\s+nào)",
            r"\?\s*$",
        ]
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ThutucError::Config(format!("Invalid filler pattern: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            llm,
            llm_timeout,
            code_pattern,
            filler_patterns,
        })
    }

    /// Analyse a question into a query plan. Never fails: LLM trouble
    /// degrades to the overview intent with the question as sole expansion.
    pub async fn analyse(&self, question: &str) -> QueryPlan {
        let detected_code = self.extract_procedure_code(question);
        if let Some(code) = &detected_code {
            tracing::debug!(code = %code, "Procedure code detected");
        }

        let processed = self.rewrite(question);
        if processed != question {
            tracing::debug!(rewritten = %processed, "Query rewritten");
        }

        let (intent, intent_confidence, llm_failed) = self.detect_intent(question).await;
        tracing::debug!(intent = intent.as_str(), intent_confidence, "Intent resolved");

        let expansions = if llm_failed {
            vec![question.to_string()]
        } else {
            self.expand(question, &processed).await
        };

        QueryPlan {
            raw_question: question.to_string(),
            intent,
            intent_confidence,
            expansions,
            detected_procedure_code: detected_code,
            context_config: context_config_for(intent),
        }
    }

    fn extract_procedure_code(&self, question: &str) -> Option<String> {
        self.code_pattern
            .find(question)
            .map(|m| m.as_str().to_string())
    }

    /// Strip filler phrasing so dense retrieval sees the domain terms; the
    /// original question is kept when the rewrite gets too short
    fn rewrite(&self, question: &str) -> String {
        let mut simplified = question.to_lowercase();
        for pattern in &self.filler_patterns {
            simplified = pattern.replace_all(&simplified, " ").into_owned();
        }

        let simplified = simplified.split_whitespace().collect::<Vec<_>>().join(" ");

        if simplified.split_whitespace().count() < 3 {
            question.to_string()
        } else {
            simplified
        }
    }

    /// Keyword scoring first, LLM when nothing matches. Returns
    /// `(intent, confidence, llm_failed)`.
    async fn detect_intent(&self, question: &str) -> (Intent, f32, bool) {
        if let Some(intent) = keyword_intent(question) {
            return (intent, 0.9, false);
        }

        match timeout(self.llm_timeout, self.llm.classify_intent(question)).await {
            Ok(Ok((intent, confidence))) => (intent, confidence, false),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Intent classification failed, falling back to overview");
                (Intent::Overview, 0.0, true)
            }
            Err(_) => {
                tracing::warn!("Intent classification timed out, falling back to overview");
                (Intent::Overview, 0.0, true)
            }
        }
    }

    /// Build the expansion list: the processed question, up to three LLM
    /// paraphrases, up to two synonym variants; case-insensitive dedup,
    /// capped at five
    async fn expand(&self, question: &str, processed: &str) -> Vec<String> {
        let mut expansions = vec![processed.to_string()];

        match timeout(
            self.llm_timeout,
            self.llm.paraphrase(question, NUM_PARAPHRASES),
        )
        .await
        {
            Ok(Ok(paraphrases)) => expansions.extend(paraphrases),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Paraphrase generation failed");
            }
            Err(_) => {
                tracing::warn!("Paraphrase generation timed out");
            }
        }

        expansions.extend(synonym_variants(processed, NUM_SYNONYM_VARIANTS));

        dedup_case_insensitive(expansions, MAX_EXPANSIONS)
    }
}

/// Weighted keyword matching with exclusions
fn keyword_intent(question: &str) -> Option<Intent> {
    let lower = question.to_lowercase();

    let mut best: Option<(Intent, usize)> = None;
    for (intent, keywords) in INTENT_KEYWORDS {
        let mut score = keywords.iter().filter(|kw| lower.contains(*kw)).count();

        if score > 0 {
            if let Some((_, exclusions)) = INTENT_EXCLUSIONS.iter().find(|(i, _)| i == intent) {
                if exclusions.iter().any(|excl| lower.contains(excl)) {
                    score = 0;
                }
            }
        }

        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((*intent, score));
        }
    }

    best.map(|(intent, _)| intent)
}

/// Substitute table terms to produce up to `max` variants
fn synonym_variants(question: &str, max: usize) -> Vec<String> {
    let lower = question.to_lowercase();
    let mut variants = Vec::new();

    'outer: for (term, substitutes) in SYNONYMS {
        if !lower.contains(term) {
            continue;
        }
        for substitute in *substitutes {
            variants.push(lower.replacen(term, substitute, 1));
            if variants.len() >= max {
                break 'outer;
            }
        }
    }

    variants
}

fn dedup_case_insensitive(expansions: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    expansions
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .filter(|e| seen.insert(e.to_lowercase()))
        .take(cap)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, LlmError};
    use async_trait::async_trait;

    struct StaticLlm {
        intent: Intent,
        paraphrases: Vec<String>,
    }

    #[async_trait]
    impl LlmClient for StaticLlm {
        async fn classify_intent(&self, _question: &str) -> std::result::Result<(Intent, f32), LlmError> {
            Ok((self.intent, 0.8))
        }

        async fn paraphrase(
            &self,
            _question: &str,
            n: usize,
        ) -> std::result::Result<Vec<String>, LlmError> {
            Ok(self.paraphrases.iter().take(n).cloned().collect())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn classify_intent(&self, _question: &str) -> std::result::Result<(Intent, f32), LlmError> {
            Err(LlmError::RequestError("connection refused".to_string()))
        }

        async fn paraphrase(
            &self,
            _question: &str,
            _n: usize,
        ) -> std::result::Result<Vec<String>, LlmError> {
            Err(LlmError::RequestError("connection refused".to_string()))
        }
    }

    fn analyser(llm: Arc<dyn LlmClient>) -> QueryAnalyser {
        QueryAnalyser::new(llm, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_code_detection() {
        let a = analyser(Arc::new(FailingLlm));
        let plan = a.analyse("Thủ tục 1.013124 cần giấy tờ gì?").await;
        assert_eq!(plan.detected_procedure_code.as_deref(), Some("1.013124"));
    }

    #[tokio::test]
    async fn test_no_code() {
        let a = analyser(Arc::new(FailingLlm));
        let plan = a.analyse("Đăng ký kết hôn ở đâu?").await;
        assert!(plan.detected_procedure_code.is_none());
    }

    #[tokio::test]
    async fn test_keyword_intent_documents() {
        let a = analyser(Arc::new(FailingLlm));
        let plan = a.analyse("Đăng ký kết hôn cần giấy tờ gì?").await;
        assert_eq!(plan.intent, Intent::Documents);
        assert_eq!(plan.intent_confidence, 0.9);
    }

    #[tokio::test]
    async fn test_keyword_intent_exclusion() {
        // Mentions documents but asks about timing
        let a = analyser(Arc::new(FailingLlm));
        let plan = a
            .analyse("Nộp giấy tờ cần nộp rồi thì bao lâu có kết quả?")
            .await;
        assert_eq!(plan.intent, Intent::Timeline);
    }

    #[tokio::test]
    async fn test_llm_intent_when_no_keyword() {
        let a = analyser(Arc::new(StaticLlm {
            intent: Intent::Overview,
            paraphrases: vec![],
        }));
        let plan = a.analyse("Thủ tục đăng ký kết hôn").await;
        assert_eq!(plan.intent, Intent::Overview);
        assert_eq!(plan.intent_confidence, 0.8);
    }

    #[tokio::test]
    async fn test_llm_failure_fallback() {
        let a = analyser(Arc::new(FailingLlm));
        let question = "Thủ tục đăng ký thường trú";
        let plan = a.analyse(question).await;

        assert_eq!(plan.intent, Intent::Overview);
        assert_eq!(plan.intent_confidence, 0.0);
        assert_eq!(plan.expansions, vec![question.to_string()]);
    }

    #[tokio::test]
    async fn test_expansion_cap() {
        let a = analyser(Arc::new(StaticLlm {
            intent: Intent::Overview,
            paraphrases: vec![
                "biến thể một".to_string(),
                "biến thể hai".to_string(),
                "biến thể ba".to_string(),
            ],
        }));
        let plan = a.analyse("Đăng ký giấy tờ kết hôn cần lệ phí").await;

        assert!(plan.expansions.len() <= 5);
        // First expansion is the question itself (lowercased by rewrite or not)
        assert!(plan.expansions[0].to_lowercase().contains("kết hôn"));
    }

    #[tokio::test]
    async fn test_expansion_dedup() {
        let a = analyser(Arc::new(StaticLlm {
            intent: Intent::Overview,
            paraphrases: vec![
                "Thủ tục đăng ký thường trú".to_string(),
                "THỦ TỤC ĐĂNG KÝ THƯỜNG TRÚ".to_string(),
            ],
        }));
        let plan = a.analyse("Thủ tục đăng ký thường trú").await;

        let lowered: Vec<String> = plan
            .expansions
            .iter()
            .map(|e| e.to_lowercase())
            .collect();
        let mut unique = lowered.clone();
        unique.dedup();
        assert_eq!(lowered.len(), unique.len());
    }

    #[test]
    fn test_synonym_variants() {
        let variants = synonym_variants("đăng ký kết hôn cần giấy tờ gì", 2);
        assert_eq!(variants.len(), 2);
        assert!(variants[0].contains("đk"));
        assert!(variants[1].contains("ghi danh"));
    }

    #[test]
    fn test_rewrite_keeps_short_queries() {
        let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
        let a = analyser(llm);
        assert_eq!(a.rewrite("Kết hôn?"), "Kết hôn?");
    }

    #[test]
    fn test_rewrite_strips_fillers() {
        let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
        let a = analyser(llm);
        let rewritten = a.rewrite("Nếu tôi muốn đăng ký kết hôn thì làm như thế nào?");
        assert!(!rewritten.contains("nếu tôi"));
        assert!(!rewritten.ends_with('?'));
        assert!(rewritten.contains("đăng ký kết hôn"));
    }
}
