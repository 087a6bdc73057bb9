//! Agent collaborator boundary and the default persona-backed agent
//!
//! The bridge treats an agent as a black box with three hooks: initialize,
//! submit a message, and (optionally) reset history. Replies never come back
//! as return values - the agent pushes them into the `ReplySink` it was given
//! when it was constructed.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::options::InitOptions;
use crate::persona::Persona;
use crate::provider::{ChatTurn, CompletionProvider, OpenAiCompatClient};
use crate::relay::ReplySink;
use crate::types::MessageEnvelope;

/// One opaque conversational agent
#[async_trait]
pub trait ChatAgent: Send {
    /// One-time setup before the agent may receive messages
    async fn initialize(&mut self) -> Result<()>;

    /// Run the agent's pipeline for one message. Any replies go through the
    /// agent's reply sink; returning without delivering anything is silence.
    async fn submit_message(&mut self, envelope: MessageEnvelope) -> Result<()>;

    /// Whether `reset_history` does anything
    fn supports_reset(&self) -> bool {
        false
    }

    async fn reset_history(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the agents of a pool
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Shared setup, run once per pool build before any agent is created.
    /// A failure here fails the whole pool.
    async fn prepare(&self, _options: &InitOptions) -> Result<()> {
        Ok(())
    }

    /// Create the agent for one persona, wired to its reply sink
    fn create(
        &self,
        persona: &Persona,
        options: &InitOptions,
        sink: Arc<dyn ReplySink>,
    ) -> Result<Box<dyn ChatAgent>>;
}

/// LLM-backed agent that plays a persona and remembers the recent conversation
pub struct PersonaAgent {
    name: String,
    provider: Arc<dyn CompletionProvider>,
    sink: Arc<dyn ReplySink>,
    /// history[0] is always the system prompt
    history: Vec<ChatTurn>,
    history_limit: usize,
    initialized: bool,
}

impl PersonaAgent {
    pub fn new(
        persona: &Persona,
        provider: Arc<dyn CompletionProvider>,
        sink: Arc<dyn ReplySink>,
        history_limit: usize,
    ) -> Self {
        Self {
            name: persona.name.clone(),
            provider,
            sink,
            history: vec![ChatTurn::system(persona.system_prompt())],
            history_limit,
            initialized: false,
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    fn trim_history(&mut self) {
        let turns = self.history.len().saturating_sub(1);
        if turns > self.history_limit {
            let excess = turns - self.history_limit;
            self.history.drain(1..1 + excess);
        }
    }
}

#[async_trait]
impl ChatAgent for PersonaAgent {
    async fn initialize(&mut self) -> Result<()> {
        if self.history_limit == 0 {
            bail!("history limit must be at least 1");
        }
        if self.history.first().is_none_or(|turn| turn.content.is_empty()) {
            bail!("persona {} has no system prompt", self.name);
        }
        self.initialized = true;
        info!("{} ready (model: {})", self.name, self.provider.model());
        Ok(())
    }

    async fn submit_message(&mut self, envelope: MessageEnvelope) -> Result<()> {
        if !self.initialized {
            return Err(anyhow!("{} has not been initialized", self.name));
        }

        self.history.push(ChatTurn::user(format!(
            "{}: {}",
            envelope.sender.nickname, envelope.raw_text
        )));
        self.trim_history();

        let reply = match self.provider.complete(&self.history).await {
            Ok(reply) => reply,
            Err(e) => {
                // drop the unanswered turn so history keeps alternating
                self.history.pop();
                return Err(e).with_context(|| format!("{} failed to reply", self.name));
            }
        };

        if reply.is_empty() {
            debug!("{} chose not to reply to {}", self.name, envelope.message_id);
            return Ok(());
        }

        self.history.push(ChatTurn::assistant(reply.clone()));
        self.trim_history();
        debug!("{} replied ({} chars)", self.name, reply.len());
        self.sink.deliver(reply);
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        true
    }

    async fn reset_history(&mut self) -> Result<()> {
        self.history.truncate(1);
        debug!("{} history cleared", self.name);
        Ok(())
    }
}

/// Production factory: one `PersonaAgent` per persona, all sharing a single
/// HTTP connection pool to the completion endpoint
#[derive(Default)]
pub struct PersonaAgentFactory {
    client: OnceLock<Client>,
}

impl PersonaAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentFactory for PersonaAgentFactory {
    async fn prepare(&self, options: &InitOptions) -> Result<()> {
        let url = url::Url::parse(&options.base_url)
            .with_context(|| format!("Invalid base URL: {}", options.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("Unsupported base URL scheme: {}", url.scheme());
        }

        if self.client.get().is_none() {
            let client = OpenAiCompatClient::http_client()?;
            // a concurrent prepare may have won; either client is fine
            let _ = self.client.set(client);
        }
        Ok(())
    }

    fn create(
        &self,
        persona: &Persona,
        options: &InitOptions,
        sink: Arc<dyn ReplySink>,
    ) -> Result<Box<dyn ChatAgent>> {
        let client = self
            .client
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("agent factory used before prepare"))?;
        let provider = Arc::new(OpenAiCompatClient::with_client(client, options));
        Ok(Box::new(PersonaAgent::new(
            persona,
            provider,
            sink,
            options.history_limit,
        )))
    }
}
