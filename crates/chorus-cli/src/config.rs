use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use chorus_core::mask_secret;
use chorus_core::options::{
    DEFAULT_BASE_URL, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
    DEFAULT_PIPELINE_TIMEOUT_SECS, DEFAULT_TEMPERATURE,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_agent_count")]
    pub agent_count: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent_count: default_agent_count(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            history_limit: default_history_limit(),
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_agent_count() -> usize {
    3
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_pipeline_timeout_secs() -> u64 {
    DEFAULT_PIPELINE_TIMEOUT_SECS
}
fn default_poll_interval_ms() -> u64 {
    500
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chorus")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl ChorusConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path.clone().unwrap_or_else(default_config_path);

        #[cfg(unix)]
        warn_if_world_readable(&path);

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `chorus init` first.",
                path.display()
            )
        })?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        if !config.provider.api_key.is_empty() && !content.contains("${CHORUS_API_KEY}") {
            warn!(
                "API key is hardcoded in config file. For security, use: api_key = \"${{CHORUS_API_KEY}}\""
            );
        }
        Ok(config)
    }

    /// The structured options object handed to the host on initialize.
    /// Blank model and base URL are left out so the host's environment
    /// fallbacks and defaults apply.
    pub fn host_options_json(&self) -> String {
        let mut options = serde_json::json!({
            "temperature": self.bridge.temperature,
            "max_tokens": self.bridge.max_tokens,
            "history_limit": self.bridge.history_limit,
            "pipeline_timeout_secs": self.bridge.pipeline_timeout_secs,
        });
        for (key, value) in [
            ("model_name", &self.provider.model),
            ("base_url", &self.provider.base_url),
        ] {
            if !value.trim().is_empty() {
                options[key] = serde_json::Value::from(value.trim());
            }
        }
        options.to_string()
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.provider.api_key = mask_secret(&config.provider.api_key);
        config
    }
}

#[cfg(unix)]
fn warn_if_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "Config file {} is readable by others ({:o}) and may contain secrets. Fix with: chmod 600 {}",
                path.display(),
                mode & 0o777,
                path.display()
            );
        }
    }
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &["CHORUS_API_KEY", "CHORUS_BASE_URL", "CHORUS_MODEL"];

fn expand_env_vars(s: &str) -> String {
    expand_env_vars_with(s, |name| std::env::var(name).ok())
}

fn expand_env_vars_with<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DEFAULT_TOML: &str = include_str!("../../../config/default.toml");

    fn lookup(name: &str) -> Option<String> {
        match name {
            "CHORUS_API_KEY" => Some("sk-from-env".to_string()),
            "HOME" => Some("/home/someone".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_allowlisted_var() {
        let out = expand_env_vars_with("api_key = \"${CHORUS_API_KEY}\"", lookup);
        assert_eq!(out, "api_key = \"sk-from-env\"");
    }

    #[test]
    fn test_unlisted_var_left_alone() {
        let out = expand_env_vars_with("path = \"${HOME}/x\"", lookup);
        assert_eq!(out, "path = \"${HOME}/x\"");
    }

    #[test]
    fn test_missing_var_expands_empty() {
        let out = expand_env_vars_with("model = \"${CHORUS_MODEL}\"", lookup);
        assert_eq!(out, "model = \"\"");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let out = expand_env_vars_with("a = \"${CHORUS_API_KEY\"", lookup);
        assert_eq!(out, "a = \"${CHORUS_API_KEY\"");
    }

    #[test]
    fn test_default_config_parses() {
        let config: ChorusConfig = toml::from_str(DEFAULT_TOML).unwrap();
        assert_eq!(config.provider.model, "deepseek-chat");
        assert_eq!(config.bridge.agent_count, 3);
        assert_eq!(config.bridge.poll_interval_ms, 500);
        assert_eq!(config.bridge.pipeline_timeout_secs, 120);
    }

    #[test]
    fn test_bridge_section_optional() {
        let config = ChorusConfig::from_toml("[provider]\napi_key = \"sk-abcdefgh1234\"\n").unwrap();
        assert_eq!(config.provider.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.bridge.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn test_host_options_json() {
        let config = ChorusConfig::from_toml(
            "[provider]\nmodel = \"qwen-plus\"\n[bridge]\nhistory_limit = 6\n",
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&config.host_options_json()).unwrap();
        assert_eq!(value["model_name"], "qwen-plus");
        assert_eq!(value["history_limit"], 6);
    }

    #[test]
    fn test_host_options_json_skips_blank_strings() {
        let config =
            ChorusConfig::from_toml("[provider]\nmodel = \"\"\nbase_url = \" \"\n").unwrap();
        let value: serde_json::Value = serde_json::from_str(&config.host_options_json()).unwrap();
        assert!(value.get("model_name").is_none());
        assert!(value.get("base_url").is_none());
        assert_eq!(value["history_limit"], DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn test_redacted_and_debug_mask_key() {
        let config =
            ChorusConfig::from_toml("[provider]\napi_key = \"sk-abcdefgh1234\"\n").unwrap();
        assert_eq!(config.redacted().provider.api_key, "sk-...1234");
        assert!(!format!("{:?}", config).contains("abcdefgh"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[provider]\nmodel = \"local\"\n[bridge]\nagent_count = 5").unwrap();
        let config = ChorusConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.provider.model, "local");
        assert_eq!(config.bridge.agent_count, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChorusConfig::load(&Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("chorus init"));
    }
}
