//! HTTP text-generation provider (Ollama-compatible endpoint).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::provider::{InferenceProvider, InferenceRequest, InferenceResponse, ProviderError};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Provider speaking the Ollama generate API (`POST {base}/api/generate`).
#[derive(Debug, Clone)]
pub struct HttpInferenceProvider {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    model: String,
}

impl HttpInferenceProvider {
    pub fn new(
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, default_model, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        })
    }

    fn map_request_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() {
            ProviderError::Connection(err.to_string())
        } else {
            ProviderError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl InferenceProvider for HttpInferenceProvider {
    #[instrument(skip(self, request), fields(model = %request.model), err)]
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
        let model = if request.model.is_empty() {
            self.default_model.as_str()
        } else {
            request.model.as_str()
        };

        let body = GenerateBody {
            model,
            prompt: &request.prompt,
            system: request.system_prompt.as_deref(),
            stream: false,
            format: request.output_schema.as_ref(),
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(InferenceResponse {
            content: parsed.response,
            model: if parsed.model.is_empty() {
                model.to_string()
            } else {
                parsed.model
            },
        })
    }
}
