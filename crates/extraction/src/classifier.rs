//! LLM-based content classification into domains.
//!
//! The classifier never fails: every error path collapses to the fallback
//! domain with confidence 0 and an explanatory reason.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use kmapper_core::TenantId;
use kmapper_inference::{InferenceProvider, InferenceRequest};

use crate::domains::registry::DEFAULT_FALLBACK_DOMAIN;
use crate::domains::{ClassificationResult, DomainSchemaRegistry, schema::DomainAlternative};

/// Content shorter than this is not worth classifying.
const MIN_CLASSIFICATION_CHARS: usize = 100;
/// Content is truncated to this many characters before transmission.
const MAX_CLASSIFICATION_CHARS: usize = 4000;
/// Below this confidence, the fallback domain is used.
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap());
static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b").unwrap());
static CC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap());

/// Classifies a content sample into a registered domain.
pub struct ContentClassifier {
    provider: Arc<dyn InferenceProvider>,
    registry: Arc<DomainSchemaRegistry>,
    confidence_threshold: f64,
    fallback_domain: String,
}

impl ContentClassifier {
    pub fn new(provider: Arc<dyn InferenceProvider>, registry: Arc<DomainSchemaRegistry>) -> Self {
        Self {
            provider,
            registry,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            fallback_domain: DEFAULT_FALLBACK_DOMAIN.to_string(),
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_fallback_domain(mut self, domain: impl Into<String>) -> Self {
        self.fallback_domain = domain.into();
        self
    }

    /// Classify a content sample.
    ///
    /// Pipeline: length check → PII sanitization → truncation → prompt →
    /// provider call → JSON parse → domain validation → confidence floor.
    pub async fn classify(
        &self,
        content: &str,
        tenant_id: Option<TenantId>,
    ) -> ClassificationResult {
        let stripped = content.trim();
        if stripped.chars().count() < MIN_CLASSIFICATION_CHARS {
            info!(
                content_length = stripped.chars().count(),
                tenant_id = ?tenant_id,
                "content too short for classification"
            );
            return self.fallback_result("Content too short");
        }

        let sanitized = sanitize(stripped);
        let truncated: String = sanitized.chars().take(MAX_CLASSIFICATION_CHARS).collect();
        let prompt = self.build_prompt(&truncated);

        let request = InferenceRequest::new(prompt)
            .with_system_prompt(
                "You are a content classifier. Respond with only valid JSON, no other text.",
            )
            .with_temperature(0.1)
            .with_max_tokens(500);

        let response = match self.provider.infer(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, tenant_id = ?tenant_id, "classification provider call failed");
                return self.fallback_result(format!("Provider error: {err}"));
            }
        };

        let result = self.parse_response(&response.content);

        if result.confidence < self.confidence_threshold {
            info!(
                domain = %result.domain,
                confidence = result.confidence,
                threshold = self.confidence_threshold,
                tenant_id = ?tenant_id,
                "classification below confidence floor"
            );
            return ClassificationResult {
                domain: self.fallback_domain.clone(),
                confidence: result.confidence,
                reasoning: Some(format!(
                    "Low confidence classification ({:.2} < {:.2}). Original: {}. {}",
                    result.confidence,
                    self.confidence_threshold,
                    result.domain,
                    result.reasoning.as_deref().unwrap_or(""),
                )),
                alternatives: vec![DomainAlternative {
                    domain: result.domain,
                    confidence: result.confidence,
                }],
            };
        }

        info!(
            domain = %result.domain,
            confidence = result.confidence,
            tenant_id = ?tenant_id,
            "classification completed"
        );
        result
    }

    fn build_prompt(&self, content: &str) -> String {
        let domain_list = self
            .registry
            .list_domains()
            .iter()
            .map(|d| format!("- {}: {}", d.domain_id, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a content classifier. Analyze the following content and classify it into exactly one of these domains:\n\n\
             {domain_list}\n\n\
             Respond with ONLY a JSON object in this exact format:\n\
             {{\"domain\": \"<domain_id>\", \"confidence\": <0.0-1.0>, \"reasoning\": \"<brief explanation>\"}}\n\n\
             Content to classify:\n---\n{content}\n---\n\n\
             Remember: Respond with ONLY the JSON object, no other text."
        )
    }

    fn parse_response(&self, response: &str) -> ClassificationResult {
        let start = response.find('{');
        let end = response.rfind('}');
        let (Some(start), Some(end)) = (start, end) else {
            warn!("no JSON object in classification response");
            return self.fallback_result("Parse error: no JSON object found");
        };
        if end < start {
            return self.fallback_result("Parse error: malformed JSON object");
        }

        let parsed: serde_json::Value = match serde_json::from_str(&response[start..=end]) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to parse classification response");
                return self.fallback_result(format!("Parse error: {err}"));
            }
        };

        let domain = parsed
            .get("domain")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.fallback_domain)
            .to_string();
        let confidence = parsed
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let reasoning = parsed
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if !self.registry.has_domain(&domain) {
            warn!(domain = %domain, fallback = %self.fallback_domain, "unknown domain in classification response");
            return ClassificationResult {
                domain: self.fallback_domain.clone(),
                confidence: (confidence - 0.3).max(0.3),
                reasoning: Some(format!(
                    "Unknown domain '{}' in response, using fallback. Original reasoning: {}",
                    domain,
                    reasoning.as_deref().unwrap_or(""),
                )),
                alternatives: vec![],
            };
        }

        ClassificationResult {
            domain,
            confidence,
            reasoning,
            alternatives: vec![],
        }
    }

    fn fallback_result(&self, reason: impl Into<String>) -> ClassificationResult {
        ClassificationResult {
            domain: self.fallback_domain.clone(),
            confidence: 0.0,
            reasoning: Some(reason.into()),
            alternatives: vec![],
        }
    }
}

/// Redact PII-shaped substrings before transmission to the provider.
fn sanitize(content: &str) -> String {
    let sanitized = EMAIL_RE.replace_all(content, "[EMAIL]");
    let sanitized = PHONE_RE.replace_all(&sanitized, "[PHONE]");
    let sanitized = SSN_RE.replace_all(&sanitized, "[REDACTED]");
    CC_RE.replace_all(&sanitized, "[REDACTED]").into_owned()
}
