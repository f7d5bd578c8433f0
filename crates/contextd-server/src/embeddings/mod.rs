// crates/contextd-server/src/embeddings/mod.rs
// Embedding provider module

mod ollama;
mod openai;

pub use self::ollama::OllamaEmbeddings;
pub use self::openai::{OpenAiEmbeddingModel, OpenAiEmbeddings};

use crate::config::{ApiKeys, EmbeddingsConfig};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Producer of unit-norm dense vectors of a fixed dimension.
///
/// Implementations must be deterministic per (model, text).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
}

/// Embedding client with automatic provider selection
///
/// Priority: OpenAI (highest quality) > Ollama (local, no key needed)
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Provider identifier for change detection
    pub fn provider_id(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Ollama(_) => "ollama",
        }
    }

    /// Create a new embedding client from pre-loaded configuration.
    ///
    /// Priority: OpenAI key > Ollama host > None
    pub fn from_config(api_keys: &ApiKeys, config: &EmbeddingsConfig) -> Option<Self> {
        if let Some(api_key) = api_keys.openai.as_ref() {
            info!("Using OpenAI embeddings (text-embedding-3-small)");
            return Some(Self {
                backend: EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(
                    api_key.clone(),
                    OpenAiEmbeddingModel::default(),
                    config.dimensions,
                )),
            });
        }

        if let Some(host) = api_keys.ollama.as_ref() {
            let client = OllamaEmbeddings::new(
                host.clone(),
                config.ollama_model.clone(),
                config.dimensions,
            );
            info!(
                model = client.model_name(),
                dimensions = client.dimensions(),
                "Using Ollama embeddings"
            );
            return Some(Self {
                backend: EmbeddingBackend::Ollama(client),
            });
        }

        None
    }

    /// Get model name for display/logging
    pub fn model_name(&self) -> String {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.model().model_name().to_string(),
            EmbeddingBackend::Ollama(c) => c.model_name().to_string(),
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed(text).await?,
            EmbeddingBackend::Ollama(c) => c.embed(text).await?,
        };
        normalize(&mut vector);
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(texts).await?,
            EmbeddingBackend::Ollama(c) => c.embed_batch(texts).await?,
        };
        for vector in &mut vectors {
            normalize(vector);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
        }
    }
}
