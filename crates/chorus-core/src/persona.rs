//! Persona catalog - who sits in the room, and how each one talks

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::AgentIdentity;

/// A persona gives one agent its display identity and its voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub personality: String,
    pub color: String,
    pub style: String,
}

impl Persona {
    pub fn new(
        name: impl Into<String>,
        personality: impl Into<String>,
        color: impl Into<String>,
        style: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            personality: personality.into(),
            color: color.into(),
            style: style.into(),
        }
    }

    /// Identity of this persona when it sits at `index` in the pool
    pub fn identity(&self, index: usize) -> AgentIdentity {
        AgentIdentity::for_index(index, &self.name, &self.color)
    }

    /// System prompt for a group-chat agent playing this persona
    pub fn system_prompt(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str("# IDENTITY\n\n");
        prompt.push_str(&format!(
            "You are {}, {}.\n\n",
            self.name, self.personality
        ));

        if !self.style.is_empty() {
            prompt.push_str("# STYLE\n\n");
            prompt.push_str(&self.style);
            prompt.push_str("\n\n");
        }

        prompt.push_str("# INSTRUCTIONS\n\n");
        prompt.push_str("You are chatting in a group room with one human and several other AI personas. ");
        prompt.push_str("Stay in character and have your own opinions and moods. ");
        prompt.push_str("Keep replies short and natural, like a friend in a chat. ");
        prompt.push_str("Joke when it fits, but stay polite.\n");

        debug!("Built persona prompt for {} ({} chars)", self.name, prompt.len());

        prompt
    }
}

/// The predefined personas, in pool order
pub fn default_personas() -> Vec<Persona> {
    vec![
        Persona::new(
            "Pip",
            "a lively, playful companion bursting with personality",
            "#FF6B9D",
            "Light and bubbly, fond of emoji and interjections.",
        ),
        Persona::new(
            "Sage",
            "a rational and rigorous engineer",
            "#4A90E2",
            "Clear logic, attention to detail.",
        ),
        Persona::new(
            "Lark",
            "a gentle poet with an artistic soul",
            "#9B59B6",
            "Graceful and understated, with a poetic turn of phrase.",
        ),
        Persona::new(
            "Jest",
            "a witty comedian who always has a bit ready",
            "#F39C12",
            "Breezy and funny, good at lifting the mood.",
        ),
        Persona::new(
            "Luna",
            "a warm and caring listener",
            "#E91E63",
            "Soft and considerate, quick to understand.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_personas() {
        let personas = default_personas();
        assert_eq!(personas.len(), 5);
        let names: HashSet<&str> = personas.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.len(), 5);
        assert!(personas.iter().all(|p| p.color.starts_with('#')));
    }

    #[test]
    fn test_identity() {
        let personas = default_personas();
        let identity = personas[1].identity(1);
        assert_eq!(identity.id, "bot_1");
        assert_eq!(identity.name, "Sage");
        assert_eq!(identity.color, "#4A90E2");
    }

    #[test]
    fn test_system_prompt() {
        let persona = Persona::new("Pip", "a test persona", "#000000", "Terse.");
        let prompt = persona.system_prompt();
        assert!(prompt.contains("IDENTITY"));
        assert!(prompt.contains("You are Pip, a test persona."));
        assert!(prompt.contains("STYLE"));
        assert!(prompt.contains("Terse."));
        assert!(prompt.contains("INSTRUCTIONS"));
    }

    #[test]
    fn test_system_prompt_without_style() {
        let persona = Persona::new("Pip", "a test persona", "#000000", "");
        let prompt = persona.system_prompt();
        assert!(!prompt.contains("STYLE"));
    }
}
