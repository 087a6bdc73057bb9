//! Structured options passed across the host boundary as a JSON string

use anyhow::{Context, Result};
use serde::Deserialize;

use chorus_core::options::{DEFAULT_BASE_URL, DEFAULT_MODEL, InitOptions};

pub const ENV_API_KEY: &str = "CHORUS_API_KEY";
pub const ENV_BASE_URL: &str = "CHORUS_BASE_URL";
pub const ENV_MODEL: &str = "CHORUS_MODEL";

/// Recognized keys; anything else in the object is ignored
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostOptions {
    #[serde(default, alias = "model")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub history_limit: Option<usize>,
    #[serde(default)]
    pub pipeline_timeout_secs: Option<u64>,
}

impl HostOptions {
    /// Parse the options object. Blank input and `null` mean "no overrides".
    pub fn parse(json: &str) -> Result<Self> {
        let json = json.trim();
        if json.is_empty() {
            return Ok(Self::default());
        }
        let parsed: Option<Self> =
            serde_json::from_str(json).context("Failed to parse host options")?;
        Ok(parsed.unwrap_or_default())
    }

    /// Merge with the credential, the agent count and environment fallbacks.
    /// Explicit options win over the environment, which wins over defaults.
    pub fn into_init_options<F>(self, credential: &str, agent_count: usize, env: F) -> InitOptions
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let credential = if credential.trim().is_empty() {
            env(ENV_API_KEY).unwrap_or_default()
        } else {
            credential.to_string()
        };

        let mut options = InitOptions::new(credential, agent_count)
            .with_model(
                self.model_name
                    .or_else(|| env(ENV_MODEL))
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            )
            .with_base_url(
                self.base_url
                    .or_else(|| env(ENV_BASE_URL))
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            );

        if let Some(temperature) = self.temperature {
            options.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            options.max_tokens = max_tokens;
        }
        if let Some(history_limit) = self.history_limit {
            options.history_limit = history_limit;
        }
        if let Some(secs) = self.pipeline_timeout_secs {
            options.pipeline_timeout_secs = secs;
        }
        options
    }
}

/// Build init options from host arguments and the process environment
pub fn resolve_init_options(credential: &str, agent_count: usize, json: &str) -> Result<InitOptions> {
    let options = HostOptions::parse(json)?;
    Ok(options.into_init_options(credential, agent_count, |key| std::env::var(key).ok()))
}
