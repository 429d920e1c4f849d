use serde::{Deserialize, Serialize};

use crate::types::MessageRole;

/// Why the model stopped producing output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the reply.
    Stop,

    /// The token limit was hit.
    Length,

    /// The model wants tools to be called.
    ToolCalls,

    /// Output was withheld by a content filter.
    ContentFilter,

    /// Legacy single function call.
    FunctionCall,

    /// A reason this crate does not know about.
    #[serde(other)]
    Other,
}

/// A fragment of a function call inside a streamed tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    /// Function name; only present on the first fragment of a call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// A slice of the argument text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A fragment of one tool call.
///
/// Fragments of the same call share an `index`; the `id` only rides on the
/// first one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the assistant message.
    #[serde(default)]
    pub index: u32,

    /// Call identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Function name and argument fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

impl ToolCallDelta {
    /// Create a delta that opens a call.
    pub fn start(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            function: Some(FunctionCallDelta {
                name: Some(name.into()),
                arguments: Some(String::new()),
            }),
        }
    }

    /// Create a delta that continues a call's arguments.
    pub fn arguments(index: u32, arguments: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            function: Some(FunctionCallDelta {
                name: None,
                arguments: Some(arguments.into()),
            }),
        }
    }
}

/// The incremental payload of one choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role; only present on the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,

    /// A slice of the reply text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool call fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// One choice of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index; always zero for single-choice requests.
    #[serde(default)]
    pub index: u32,

    /// The incremental payload.
    #[serde(default)]
    pub delta: ChunkDelta,

    /// Set on the final fragment of the choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// One fragment of a streamed chat completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion identifier shared by all fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Model that produced the fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Choices carried by this fragment.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// A fragment carrying reply text.
    pub fn content(text: impl Into<String>) -> Self {
        Self::from_delta(
            ChunkDelta {
                content: Some(text.into()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    /// A fragment carrying tool call deltas.
    pub fn tool_calls(deltas: Vec<ToolCallDelta>) -> Self {
        Self::from_delta(
            ChunkDelta {
                tool_calls: Some(deltas),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    /// An empty fragment that only carries the terminal signal.
    pub fn finish(reason: FinishReason) -> Self {
        Self::from_delta(ChunkDelta::default(), Some(reason))
    }

    fn from_delta(delta: ChunkDelta, finish_reason: Option<FinishReason>) -> Self {
        Self {
            id: None,
            model: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Returns the text slice of the first choice, if any.
    ///
    /// An empty string is still text: servers open content streams with
    /// `"content": ""` and tool streams with `"content": null`.
    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }

    /// Returns the tool call fragments of the first choice.
    pub fn tool_call_deltas(&self) -> &[ToolCallDelta] {
        self.choices
            .first()
            .and_then(|choice| choice.delta.tool_calls.as_deref())
            .unwrap_or(&[])
    }

    /// Returns the finish reason of the first choice.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|choice| choice.finish_reason)
    }
}
