//! Inference provider contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single text-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,

    /// Model name; empty string means "provider default".
    pub model: String,

    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,

    /// Optional schema-constrained decoding (providers that support it emit
    /// JSON matching this schema).
    pub output_schema: Option<serde_json::Value>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: None,
            output_schema: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Response from an inference provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// The generated text.
    pub content: String,
    /// The model that produced it.
    pub model: String,
}

/// Provider failure taxonomy.
///
/// `Timeout` and `Connection` are transient; `RateLimited` and `Upstream`
/// count toward the circuit breaker; `Decode` means the provider answered
/// but the body was not usable.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("provider connection failed: {0}")]
    Connection(String),

    #[error("provider rate limited the request")]
    RateLimited,

    #[error("provider returned an error status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether this failure should be counted by the circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, ProviderError::Decode(_))
    }
}

/// Text-generation provider (e.g. a local Ollama instance).
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError>;
}

#[async_trait]
impl<P> InferenceProvider for std::sync::Arc<P>
where
    P: InferenceProvider + ?Sized,
{
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
        (**self).infer(request).await
    }
}
