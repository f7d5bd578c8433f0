// crates/contextd-server/src/config/file.rs
// Optional TOML configuration file - env vars always win

use crate::error::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `~/.config/contextd/config.toml`, all sections optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContextdConfig {
    pub storage: StorageSection,
    pub fallback: FallbackSection,
    pub scrub: ScrubSection,
    pub indexer: IndexerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FallbackSection {
    pub ping_interval_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    pub rpc_timeout_secs: Option<u64>,
    pub retention_days: Option<i64>,
    pub breaker_threshold: Option<u32>,
    pub breaker_cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScrubSection {
    /// Extra allow-list regexes; matches inside these spans are not redacted.
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexerSection {
    pub max_file_size_bytes: Option<u64>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ContextdConfig {
    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no usable config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ContextdConfig = toml::from_str(&raw)
            .map_err(|e| crate::error::ContextdError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("contextd").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_default() {
        let config: ContextdConfig = toml::from_str("").unwrap();
        assert!(config.storage.base_dir.is_none());
        assert!(config.scrub.allowlist.is_empty());
    }

    #[test]
    fn test_partial_config_parses() {
        let config: ContextdConfig = toml::from_str(
            r#"
            [fallback]
            ping_interval_secs = 10
            retention_days = 3

            [indexer]
            exclude = ["target/**", "*.lock"]
            "#,
        )
        .unwrap();
        assert_eq!(config.fallback.ping_interval_secs, Some(10));
        assert_eq!(config.fallback.retention_days, Some(3));
        assert_eq!(config.indexer.exclude.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nbase_dir = \"/tmp/ctx\"").unwrap();
        let config = ContextdConfig::load_from(file.path()).unwrap();
        assert_eq!(config.storage.base_dir, Some(PathBuf::from("/tmp/ctx")));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not [valid toml").unwrap();
        let err = ContextdConfig::load_from(file.path()).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
