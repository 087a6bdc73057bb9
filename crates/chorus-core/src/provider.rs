//! Chat-completion providers behind persona agents
//!
//! `OpenAiCompatClient` speaks the OpenAI `/v1/chat/completions` wire format,
//! which DeepSeek, Together, Groq, Ollama and friends all accept.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::options::{InitOptions, mask_secret};

/// Message role in a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Anything that turns a conversation into the next assistant message
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Model identifier (e.g. "deepseek-chat")
    fn model(&self) -> &str;

    /// Complete the conversation; an empty string means the model said nothing
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String>;
}

/// Client for OpenAI-compatible chat completion endpoints
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiCompatClient {
    /// HTTP client with the connect/request timeouts every agent uses
    pub fn http_client() -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")
    }

    /// Build a client that reuses an existing connection pool
    pub fn with_client(client: Client, options: &InitOptions) -> Self {
        Self {
            client,
            api_key: options.credential.clone(),
            base_url: options.base_url.trim_end_matches('/').to_string(),
            model: options.model.clone(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }

    pub fn new(options: &InitOptions) -> Result<Self> {
        Ok(Self::with_client(Self::http_client()?, options))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body<'a>(&'a self, turns: &'a [ChatTurn]) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: turns,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    fn extract_content(resp: CompletionResponse) -> Result<String> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Completion response had no choices"))?;
        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, turns: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(
            "Completion request: model={}, messages={}",
            self.model,
            turns.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(turns))
            .send()
            .await
            .context("Failed to send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Completion request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        debug!("Completion response: choices={}", completion.choices.len());

        Self::extract_content(completion)
    }
}

// ── wire types ──

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}
