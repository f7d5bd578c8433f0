// crates/contextd-server/src/llm/mod.rs
// LLM client for the memory consolidator

mod openai_compat;

pub use openai_compat::OpenAiCompatClient;

use crate::config::ApiKeys;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Completion provider used by the consolidator.
///
/// Unavailable, timeout, and malformed-response failures are distinct so the
/// caller can fail a whole run versus skip a single cluster.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// Pick a provider from configured keys.
///
/// Priority: DeepSeek > OpenAI > Ollama. All three speak the same
/// chat-completions dialect, so one client covers them.
pub fn client_from_config(api_keys: &ApiKeys) -> Option<Arc<dyn LlmClient>> {
    if let Some(key) = api_keys.deepseek.as_ref() {
        info!("Using DeepSeek for consolidation");
        return Some(Arc::new(OpenAiCompatClient::new(
            "https://api.deepseek.com/v1",
            Some(key.clone()),
            "deepseek-chat",
        )));
    }
    if let Some(key) = api_keys.openai.as_ref() {
        info!("Using OpenAI for consolidation");
        return Some(Arc::new(OpenAiCompatClient::new(
            "https://api.openai.com/v1",
            Some(key.clone()),
            "gpt-4o-mini",
        )));
    }
    if let Some(host) = api_keys.ollama.as_ref() {
        info!("Using Ollama for consolidation");
        let base = format!("{}/v1", host.trim_end_matches('/'));
        return Some(Arc::new(OpenAiCompatClient::new(&base, None, "qwen2.5:7b")));
    }
    None
}
