//! Failure taxonomy for the bridge

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Fatal to the whole pool (missing credential, shared setup failed,
    /// or not a single agent came up)
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// One persona failed to start; the pool continues without it
    #[error("Agent {agent_id} failed to initialize: {reason}")]
    AgentInit { agent_id: String, reason: String },

    /// One agent's pipeline failed while handling a message
    #[error("Agent {agent_id} pipeline failed: {reason}")]
    Pipeline { agent_id: String, reason: String },

    #[error("Bridge is not ready")]
    NotReady,
}

impl BridgeError {
    pub fn initialization(err: impl std::fmt::Display) -> Self {
        Self::Initialization(err.to_string())
    }
}
