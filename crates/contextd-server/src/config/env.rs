// crates/contextd-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::{debug, warn};

/// API keys loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// OpenAI API key (OPENAI_API_KEY) - embeddings and consolidation
    pub openai: Option<String>,
    /// Ollama host (OLLAMA_HOST) - local embeddings and consolidation
    pub ollama: Option<String>,
    /// DeepSeek API key (DEEPSEEK_API_KEY) - consolidation
    pub deepseek: Option<String>,
    /// Qdrant API key (QDRANT_API_KEY) - remote vector backend auth
    pub qdrant: Option<String>,
}

impl ApiKeys {
    /// Load API keys from environment variables (single source of truth)
    pub fn from_env() -> Self {
        let keys = Self {
            openai: read_var("OPENAI_API_KEY"),
            ollama: read_var("OLLAMA_HOST"),
            deepseek: read_var("DEEPSEEK_API_KEY"),
            qdrant: read_var("QDRANT_API_KEY"),
        };
        keys.log_status();
        keys
    }

    pub fn has_embeddings(&self) -> bool {
        self.openai.is_some() || self.ollama.is_some()
    }

    pub fn has_llm(&self) -> bool {
        self.deepseek.is_some() || self.openai.is_some() || self.ollama.is_some()
    }

    /// Log which API keys are available (without exposing values)
    fn log_status(&self) {
        let mut available = Vec::new();
        if self.openai.is_some() {
            available.push("OpenAI");
        }
        if self.ollama.is_some() {
            available.push("Ollama");
        }
        if self.deepseek.is_some() {
            available.push("DeepSeek");
        }
        if available.is_empty() {
            warn!("No embedding/LLM providers configured - semantic features disabled");
        } else {
            debug!(providers = ?available, "API keys loaded");
        }
    }
}

/// Embeddings configuration from environment variables
#[derive(Debug, Clone, Default)]
pub struct EmbeddingsConfig {
    /// Custom embedding dimensions (CONTEXTD_EMBEDDING_DIMENSIONS)
    pub dimensions: Option<usize>,
    /// Ollama embedding model (CONTEXTD_OLLAMA_EMBEDDING_MODEL)
    pub ollama_model: Option<String>,
}

impl EmbeddingsConfig {
    pub fn from_env() -> Self {
        let dimensions = read_var("CONTEXTD_EMBEDDING_DIMENSIONS").and_then(|d| d.parse().ok());
        if let Some(dims) = dimensions {
            debug!(dimensions = dims, "Custom embedding dimensions configured");
        }
        Self {
            dimensions,
            ollama_model: read_var("CONTEXTD_OLLAMA_EMBEDDING_MODEL"),
        }
    }
}

/// Default tenancy from the daemon's environment; per-request tenancy
/// overrides these.
#[derive(Debug, Clone, Default)]
pub struct TenancyEnv {
    pub org: Option<String>,
    pub team: Option<String>,
    pub project: Option<String>,
}

impl TenancyEnv {
    pub fn from_env() -> Self {
        Self {
            org: read_var("CONTEXTD_ORG"),
            team: read_var("CONTEXTD_TEAM"),
            project: read_var("CONTEXTD_PROJECT"),
        }
    }
}

/// All environment-derived configuration.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub api_keys: ApiKeys,
    pub embeddings: EmbeddingsConfig,
    pub tenancy: TenancyEnv,
    /// Remote backend URL (QDRANT_URL); absent means embedded-only mode.
    pub qdrant_url: Option<String>,
    /// Storage base override (CONTEXTD_BASE_DIR)
    pub base_dir: Option<PathBuf>,
    /// Explicit scrubber bypass (CONTEXTD_DISABLE_SCRUB=1)
    pub scrub_disabled: bool,
}

impl EnvConfig {
    pub fn load() -> Self {
        Self {
            api_keys: ApiKeys::from_env(),
            embeddings: EmbeddingsConfig::from_env(),
            tenancy: TenancyEnv::from_env(),
            qdrant_url: read_var("QDRANT_URL"),
            base_dir: read_var("CONTEXTD_BASE_DIR").map(PathBuf::from),
            scrub_disabled: parse_bool(read_var("CONTEXTD_DISABLE_SCRUB")),
        }
    }
}

/// Read a single env var, filtering empty values
fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool(Some("1".into())));
        assert!(parse_bool(Some("true".into())));
        assert!(!parse_bool(Some("0".into())));
        assert!(!parse_bool(None));
    }

    #[test]
    fn test_default_keys_empty() {
        let keys = ApiKeys::default();
        assert!(!keys.has_embeddings());
        assert!(!keys.has_llm());
    }
}
