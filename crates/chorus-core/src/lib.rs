//! chorus-core - Multi-agent group chat bridge
//!
//! This crate provides:
//! - A pool of persona agents, built and initialized concurrently
//! - Fire-and-forget fan-out of one user message to every agent
//! - A thread-safe relay that queues replies for polling or pushes them to a callback
//! - Failure containment so one misbehaving agent never stalls the others
//! - An OpenAI-compatible completion client backing the default agents

pub mod agent;
pub mod bridge;
pub mod error;
pub mod handle;
pub mod options;
pub mod persona;
pub mod pool;
pub mod provider;
pub mod relay;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use agent::{AgentFactory, ChatAgent, PersonaAgent, PersonaAgentFactory};
pub use bridge::{Bridge, BridgeState, bridge_identity};
pub use error::BridgeError;
pub use handle::AgentHandle;
pub use options::{InitOptions, mask_secret};
pub use persona::{Persona, default_personas};
pub use pool::AgentPool;
pub use provider::{ChatRole, ChatTurn, CompletionProvider, OpenAiCompatClient};
pub use relay::{RelayQueue, ReplyCallback, ReplyRoute, ReplySink};
pub use types::{AgentIdentity, MessageEnvelope, ReplyRecord};
