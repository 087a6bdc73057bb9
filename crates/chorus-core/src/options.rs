//! Options shared by every agent in a pool

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 120;

/// Everything `Bridge::initialize` needs to build a pool
#[derive(Clone, Serialize, Deserialize)]
pub struct InitOptions {
    pub credential: String,
    pub agent_count: usize,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Conversation turns kept per agent, not counting the system prompt
    pub history_limit: usize,
    /// Per-message pipeline timeout; 0 disables it
    pub pipeline_timeout_secs: u64,
}

impl std::fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOptions")
            .field("credential", &mask_secret(&self.credential))
            .field("agent_count", &self.agent_count)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("history_limit", &self.history_limit)
            .field("pipeline_timeout_secs", &self.pipeline_timeout_secs)
            .finish()
    }
}

impl InitOptions {
    pub fn new(credential: impl Into<String>, agent_count: usize) -> Self {
        Self {
            credential: credential.into(),
            agent_count,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            pipeline_timeout_secs: DEFAULT_PIPELINE_TIMEOUT_SECS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_pipeline_timeout_secs(mut self, secs: u64) -> Self {
        self.pipeline_timeout_secs = secs;
        self
    }

    /// Reject options that can never produce a working pool
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.credential.trim().is_empty() {
            return Err(BridgeError::initialization("missing API credential"));
        }
        if self.model.trim().is_empty() {
            return Err(BridgeError::initialization("model name is empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(BridgeError::Initialization(format!(
                "temperature {} out of range (0.0-2.0)",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn pipeline_timeout(&self) -> Option<Duration> {
        (self.pipeline_timeout_secs > 0).then(|| Duration::from_secs(self.pipeline_timeout_secs))
    }
}

/// Mask a secret for logs and Debug output
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}
