// crates/contextd-server/src/embeddings/ollama.rs
// Ollama embeddings client - local inference, no API key

use crate::error::{ContextdError, Result};
use std::time::Duration;

const TIMEOUT_SECS: u64 = 10;
const DEFAULT_MODEL: &str = "nomic-embed-text";
const DEFAULT_DIMENSIONS: usize = 768;

/// Embeddings via a local Ollama server.
pub struct OllamaEmbeddings {
    host: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(host: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            host: host.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            http_client,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.host);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ContextdError::DeadlineExceeded("ollama embedding".into())
                } else {
                    ContextdError::Embedding(format!("ollama request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(ContextdError::Embedding(format!(
                "ollama API error {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response.json().await?;
        let embedding: Vec<f32> = json["embedding"]
            .as_array()
            .ok_or_else(|| ContextdError::Embedding("invalid ollama response".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.len() != self.dimensions {
            return Err(ContextdError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    /// Ollama has no batch endpoint; embed sequentially.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}
