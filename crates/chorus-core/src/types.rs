//! Shared types for chorus-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform tag stamped on every envelope handed to an agent
pub const PLATFORM: &str = "chorus";

/// Synthetic group every agent believes it is chatting in
pub const GROUP_ID: &str = "chorus_room";
pub const GROUP_NAME: &str = "Chorus Room";

/// Synthetic user id for the human on the other side of the host
pub const USER_ID: &str = "chorus_user";

/// Immutable identity of one agent in a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl AgentIdentity {
    /// Identity for the agent at `index` in pool order (`bot_<index>`)
    pub fn for_index(index: usize, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: format!("bot_{}", index),
            name: name.into(),
            color: color.into(),
        }
    }
}

/// One reply produced by an agent (or synthesized for a failure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub agent_id: String,
    pub agent_name: String,
    pub color: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ReplyRecord {
    pub fn new(identity: &AgentIdentity, content: impl Into<String>) -> Self {
        Self {
            agent_id: identity.id.clone(),
            agent_name: identity.name.clone(),
            color: identity.color.clone(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Record describing a failure; content is always non-empty
    pub fn failure(identity: &AgentIdentity, reason: impl std::fmt::Display) -> Self {
        let reason = reason.to_string();
        let content = if reason.is_empty() {
            "Error: unknown failure".to_string()
        } else {
            format!("Error: {}", reason)
        };
        Self::new(identity, content)
    }
}

/// Sender details carried inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderInfo {
    pub user_id: String,
    pub nickname: String,
    pub platform: String,
}

/// Group details carried inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub group_name: String,
    pub platform: String,
}

/// Structured message handed to an agent's pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub platform: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: SenderInfo,
    pub group: GroupInfo,
    pub raw_text: String,
    pub at_bot: bool,
}

impl MessageEnvelope {
    /// Wrap raw user text in a group-chat envelope addressed to the bots
    pub fn from_user(text: &str, sender_name: &str) -> Self {
        Self {
            platform: PLATFORM.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            sender: SenderInfo {
                user_id: USER_ID.to_string(),
                nickname: sender_name.to_string(),
                platform: PLATFORM.to_string(),
            },
            group: GroupInfo {
                group_id: GROUP_ID.to_string(),
                group_name: GROUP_NAME.to_string(),
                platform: PLATFORM.to_string(),
            },
            raw_text: text.to_string(),
            at_bot: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_for_index() {
        let identity = AgentIdentity::for_index(2, "Lark", "#9B59B6");
        assert_eq!(identity.id, "bot_2");
        assert_eq!(identity.name, "Lark");
        assert_eq!(identity.color, "#9B59B6");
    }

    #[test]
    fn test_failure_record_is_never_empty() {
        let identity = AgentIdentity::for_index(0, "Pip", "#FF6B9D");
        let record = ReplyRecord::failure(&identity, "");
        assert!(!record.content.is_empty());

        let record = ReplyRecord::failure(&identity, "connection refused");
        assert_eq!(record.content, "Error: connection refused");
        assert_eq!(record.agent_id, "bot_0");
    }

    #[test]
    fn test_reply_record_json_shape() {
        let identity = AgentIdentity::for_index(1, "Sage", "#4A90E2");
        let record = ReplyRecord::new(&identity, "hi");
        let value = serde_json::to_value(&record).unwrap();
        for key in ["agent_id", "agent_name", "color", "content", "timestamp"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_envelope_from_user() {
        let envelope = MessageEnvelope::from_user("hello", "alice");
        assert_eq!(envelope.platform, PLATFORM);
        assert!(envelope.message_id.starts_with("msg_"));
        assert_eq!(envelope.sender.nickname, "alice");
        assert_eq!(envelope.group.group_id, GROUP_ID);
        assert_eq!(envelope.raw_text, "hello");
        assert!(envelope.at_bot);

        let other = MessageEnvelope::from_user("hello", "alice");
        assert_ne!(envelope.message_id, other.message_id);
    }
}
