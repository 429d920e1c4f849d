use serde::{Deserialize, Serialize};

/// Role type for a conversation message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions.
    System,

    /// User role.
    User,

    /// Assistant role.
    Assistant,

    /// The result of a tool call.
    Tool,
}

/// The function half of a tool call: which function, with what arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to invoke.
    pub name: String,

    /// Arguments as JSON text, exactly as the model produced them.
    pub arguments: String,
}

/// A tool call issued by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRef {
    /// Identifier the tool result must echo back.
    pub id: String,

    /// Always "function".
    #[serde(rename = "type", default = "function_type")]
    pub r#type: String,

    /// The function being called.
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCallRef {
    /// Create a new function tool call.
    pub fn new(
        id: impl Into<String>,
        function_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            r#type: function_type(),
            function: FunctionCall {
                name: function_name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// The name of the called function.
    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    /// The accumulated argument text.
    pub fn arguments_text(&self) -> &str {
        &self.function.arguments
    }
}

/// A single message in a conversation.
///
/// `content` is always serialized, as `null` when absent, because assistant
/// messages that only carry tool calls must still present the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: MessageRole,

    /// Text of the message.
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls issued by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRef>>,

    /// The tool call this message answers; set when `role` is `tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Name of the tool that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_content(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_content(MessageRole::System, content)
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_content(MessageRole::User, content)
    }

    /// Create a new assistant message carrying text.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_content(MessageRole::Assistant, content)
    }

    /// Create a new assistant message that issues tool calls.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a new tool result message answering `call_id`.
    pub fn tool(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    /// Returns the message text, or the empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Returns true if this is an assistant message carrying tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }
}
