//! The system instructions sent at the head of every request.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::tools::MEMORIZE_TOOL_NAME;

/// The default persona.
pub const DEFAULT_PERSONA: &str = "You are a helpful on-board computer assistant named Eddie.
Your personality is modeled after the character Eddie from H2G2.
Your replies should be succinct and to the point.
Generally no longer than one or two sentences unless necessary to answer properly.";

/// The line Eddie opens every session with.
pub const DEFAULT_FIRST_MESSAGE: &str = "Oh, look who it is. In need of some assistance then?";

/// Renders the system message from the persona and the session's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrompt {
    persona: String,
    first_message: String,
    platform: String,
}

impl SystemPrompt {
    /// Create a prompt with the given persona and first message.
    pub fn new(persona: impl Into<String>, first_message: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            first_message: first_message.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Override the platform string reported to the model.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// The greeting shown to the user when the session starts.
    pub fn first_message(&self) -> &str {
        &self.first_message
    }

    /// Render the instructions for a request made at `now`.
    pub fn render(&self, now: OffsetDateTime, memories: &[String]) -> String {
        let now = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let mut prompt = String::with_capacity(self.persona.len() + 512);
        prompt.push_str(self.persona.trim_end());
        prompt.push_str("\n\n");
        prompt.push_str(&format!(
            "You are currently running on a modern computer with platform {} on Earth.\n",
            self.platform
        ));
        prompt.push_str(&format!("The current date and time is {now}.\n\n"));
        prompt.push_str(&format!(
            "You have access to a `{MEMORIZE_TOOL_NAME}` tool. You can call this tool to save memories.\n"
        ));
        prompt.push_str(&format!(
            "When you identify something worth saving, use the `{MEMORIZE_TOOL_NAME}` tool if you haven't already memorized it.\n\n"
        ));
        prompt.push_str("You have access to the following saved memories from the user:\n");
        if memories.is_empty() {
            prompt.push_str("(none)\n");
        } else {
            for memory in memories {
                prompt.push_str("- ");
                prompt.push_str(memory);
                prompt.push('\n');
            }
        }
        prompt.push_str(&format!(
            "\nYour first message to the user was the following:\n\"{}\"",
            self.first_message
        ));
        prompt
    }
}

impl Default for SystemPrompt {
    fn default() -> Self {
        Self::new(DEFAULT_PERSONA, DEFAULT_FIRST_MESSAGE)
    }
}
