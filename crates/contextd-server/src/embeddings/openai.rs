// crates/contextd-server/src/embeddings/openai.rs
// OpenAI embeddings API client

use crate::error::{ContextdError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (truncate longer text)
const MAX_TEXT_CHARS: usize = 8000;

/// Max batch size for one batch embedding request
const MAX_BATCH_SIZE: usize = 100;

/// HTTP timeout
const TIMEOUT_SECS: u64 = 10;

/// Retry attempts
const RETRY_ATTEMPTS: usize = 2;

/// API endpoint
const API_URL: &str = "https://api.openai.com/v1/embeddings";

/// Supported embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OpenAiEmbeddingModel {
    /// text-embedding-3-small: 1536 dimensions (recommended)
    #[default]
    TextEmbedding3Small,
    /// text-embedding-3-large: 3072 dimensions
    TextEmbedding3Large,
}

impl OpenAiEmbeddingModel {
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::TextEmbedding3Small => "text-embedding-3-small",
            Self::TextEmbedding3Large => "text-embedding-3-large",
        }
    }

    pub fn dimensions(&self) -> usize {
        match self {
            Self::TextEmbedding3Small => 1536,
            Self::TextEmbedding3Large => 3072,
        }
    }
}

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    model: OpenAiEmbeddingModel,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    /// Create a client; `dimensions` overrides the model default (the API
    /// truncates Matryoshka-style when asked for fewer dimensions).
    pub fn new(api_key: String, model: OpenAiEmbeddingModel, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_key,
            model,
            dimensions: dimensions.unwrap_or_else(|| model.dimensions()),
            http_client,
        }
    }

    pub fn model(&self) -> OpenAiEmbeddingModel {
        self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn request_body(&self, input: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "model": self.model.model_name(),
            "input": input,
            "dimensions": self.dimensions,
        })
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_chars(text);
        let body = self.request_body(serde_json::Value::String(text.to_string()));

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            match self.send(&body).await {
                Ok(json) => {
                    let embedding = json["data"]
                        .as_array()
                        .and_then(|data| data.first())
                        .and_then(|first| first["embedding"].as_array())
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect::<Vec<f32>>()
                        });
                    match embedding {
                        Some(vec) if vec.len() == self.dimensions => return Ok(vec),
                        _ => {
                            return Err(ContextdError::Embedding(
                                "invalid embedding response".into(),
                            ))
                        }
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ContextdError::Embedding("unknown error".into())))
    }

    /// Embed multiple texts, chunked to the provider batch limit. Multiple
    /// chunks go out in parallel; results come back in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<&[String]> = texts.chunks(MAX_BATCH_SIZE).collect();
        if chunks.len() == 1 {
            return self.embed_batch_inner(chunks[0]).await;
        }

        debug!(
            texts = texts.len(),
            batches = chunks.len(),
            "embedding in parallel batches"
        );
        let futures: Vec<_> = chunks
            .iter()
            .map(|chunk| self.embed_batch_inner(chunk))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut all_results = Vec::with_capacity(texts.len());
        for result in results {
            all_results.extend(result?);
        }
        Ok(all_results)
    }

    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(|t| truncate_chars(t)).collect();
        let body = self.request_body(serde_json::json!(inputs));
        let json = self.send(&body).await?;

        let data = json["data"]
            .as_array()
            .ok_or_else(|| ContextdError::Embedding("invalid batch response".into()))?;

        // Results carry an index field; sort to restore input order.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            if let Some(values) = item["embedding"].as_array() {
                let vec: Vec<f32> = values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();
                indexed.push((index, vec));
            }
        }
        indexed.sort_by_key(|(i, _)| *i);

        if indexed.len() != texts.len() {
            return Err(ContextdError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                indexed.len()
            )));
        }

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }

    async fn send(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .http_client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ContextdError::DeadlineExceeded("embedding request".into())
                } else {
                    ContextdError::Embedding(format!("embedding request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            debug!(%status, "embedding API error");
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ContextdError::Unauthenticated("embedding API key".into()));
            }
            return Err(ContextdError::Embedding(format!("API error {status}")));
        }

        Ok(response.json().await?)
    }
}

fn truncate_chars(text: &str) -> &str {
    if text.len() > MAX_TEXT_CHARS {
        // Back off to a char boundary so the slice never panics.
        let mut end = MAX_TEXT_CHARS;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    }
}
