// crates/contextd-server/src/llm/openai_compat.rs
// Chat-completions client for OpenAI-compatible endpoints

use super::LlmClient;
use crate::error::{ContextdError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Bounded deadline for one completion.
const TIMEOUT_SECS: u64 = 30;

/// Low temperature: consolidation wants faithful synthesis, not creativity.
const TEMPERATURE: f64 = 0.2;

const MAX_TOKENS: u32 = 1024;

/// Client for any endpoint speaking the OpenAI chat-completions dialect
/// (OpenAI, DeepSeek, Ollama's /v1 shim).
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            http_client,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ContextdError::DeadlineExceeded("llm completion".into())
            } else {
                ContextdError::LlmUnavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, model = %self.model, "LLM API error");
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ContextdError::Unauthenticated("llm API key".into()));
            }
            return Err(ContextdError::LlmUnavailable(format!("API error {status}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ContextdError::LlmParseError(format!("non-JSON response: {e}")))?;

        json["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ContextdError::LlmParseError("response missing content".into()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
