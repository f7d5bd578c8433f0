// crates/contextd-server/src/config/mod.rs
// Configuration: env-first, optional TOML file underneath

pub mod env;
pub mod file;

pub use env::{ApiKeys, EmbeddingsConfig, EnvConfig, TenancyEnv};
pub use file::ContextdConfig;

use crate::fallback::FallbackConfig;
use crate::indexer::IndexerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Merged runtime settings. Environment variables override file values.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub env: EnvConfig,
    pub file: ContextdConfig,
}

impl Settings {
    pub fn load() -> Self {
        Self {
            env: EnvConfig::load(),
            file: ContextdConfig::load(),
        }
    }

    /// Storage base: env > file > `~/.config/contextd/vectorstore`.
    pub fn base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.env.base_dir {
            return dir.clone();
        }
        if let Some(dir) = &self.file.storage.base_dir {
            return dir.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("contextd")
            .join("vectorstore")
    }

    /// Fallback tuning with file overrides applied on the defaults.
    pub fn fallback_config(&self) -> FallbackConfig {
        let mut config = FallbackConfig::default();
        let section = &self.file.fallback;
        if let Some(secs) = section.ping_interval_secs {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = section.sync_interval_secs {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = section.rpc_timeout_secs {
            config.rpc_timeout = Duration::from_secs(secs);
        }
        if let Some(days) = section.retention_days {
            config.wal_retention = chrono::Duration::days(days);
        }
        if let Some(threshold) = section.breaker_threshold {
            config.breaker_threshold = threshold;
        }
        if let Some(secs) = section.breaker_cooldown_secs {
            config.breaker_cooldown = Duration::from_secs(secs);
        }
        config
    }

    /// Indexer defaults with file overrides applied. Per-call arguments
    /// (CLI flags, tool request fields) override these in turn.
    pub fn indexer_config(&self) -> IndexerConfig {
        let mut config = IndexerConfig::default();
        let section = &self.file.indexer;
        if let Some(max) = section.max_file_size_bytes {
            config.max_file_size = max;
        }
        if !section.include.is_empty() {
            config.include = section.include.clone();
        }
        if !section.exclude.is_empty() {
            config.exclude = section.exclude.clone();
        }
        config
    }

    /// Compiled extra allow-list patterns for the scrubber. Invalid patterns
    /// are skipped rather than failing startup.
    pub fn scrub_allowlist(&self) -> Vec<regex::Regex> {
        self.file
            .scrub
            .allowlist
            .iter()
            .filter_map(|p| match regex::Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "skipping invalid scrub allowlist pattern");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_overrides_from_file() {
        let mut settings = Settings::default();
        settings.file.fallback.ping_interval_secs = Some(5);
        settings.file.fallback.retention_days = Some(1);

        let config = settings.fallback_config();
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.wal_retention, chrono::Duration::days(1));
        // Untouched fields keep their defaults.
        assert_eq!(
            config.breaker_threshold,
            crate::fallback::breaker::DEFAULT_FAILURE_THRESHOLD
        );
    }

    #[test]
    fn test_indexer_overrides_from_file() {
        let mut settings = Settings::default();
        settings.file.indexer.max_file_size_bytes = Some(2048);
        settings.file.indexer.exclude = vec!["target/**".into()];

        let config = settings.indexer_config();
        assert_eq!(config.max_file_size, 2048);
        assert_eq!(config.exclude, vec!["target/**".to_string()]);
        // Untouched fields keep their defaults.
        assert!(config.include.is_empty());

        let defaults = Settings::default().indexer_config();
        assert_eq!(defaults.max_file_size, crate::indexer::DEFAULT_MAX_FILE_SIZE);
    }

    #[test]
    fn test_env_base_dir_wins() {
        let mut settings = Settings::default();
        settings.file.storage.base_dir = Some(PathBuf::from("/from/file"));
        settings.env.base_dir = Some(PathBuf::from("/from/env"));
        assert_eq!(settings.base_dir(), PathBuf::from("/from/env"));
    }

    #[test]
    fn test_invalid_allowlist_patterns_skipped() {
        let mut settings = Settings::default();
        settings.file.scrub.allowlist = vec!["valid-[0-9]+".into(), "broken[".into()];
        assert_eq!(settings.scrub_allowlist().len(), 1);
    }
}
