//! Tool calls: reassembly, dispatch and the built-in `Memorize` tool.
//!
//! Tool calls arrive in fragments.  [`ToolCallAccumulator`] stitches the
//! fragments of each call back together, [`ToolRegistry`] maps function names
//! to [`Tool`] implementations, and [`ToolInvoker`] runs a completed call
//! against the registry.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryList, MemoryStore};
use crate::observability::{SESSION_TOOL_CALLS, SESSION_TOOL_ERRORS};
use crate::types::{ChatCompletionChunk, Message, ToolCallRef, ToolDefinition};

/// Name under which the memory tool is offered to the model.
pub const MEMORIZE_TOOL_NAME: &str = "Memorize";

///////////////////////////////////////////// ToolOutput /////////////////////////////////////////////

/// What a tool hands back after running.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// The value reported back to the model.
    pub value: Value,
    /// A fact the tool persisted, if any.
    pub memory: Option<String>,
    /// The full memory list after the tool persisted a fact.
    pub memories: Option<MemoryList>,
}

impl ToolOutput {
    /// An output that only reports a value.
    pub fn value(value: Value) -> Self {
        Self {
            value,
            memory: None,
            memories: None,
        }
    }
}

/// Resources tools may use while running.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The durable memory store.
    pub memories: MemoryStore,
}

/////////////////////////////////////////////// Tool ///////////////////////////////////////////////

/// A local function the model can call.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Returns the name of the tool.
    fn name(&self) -> String;
    /// Returns the definition sent to the model.
    fn definition(&self) -> ToolDefinition;
    /// Runs the tool with already-parsed arguments.
    async fn call(&self, context: &ToolContext, arguments: Value) -> Result<ToolOutput>;
}

/// Saves one short sentence about the user to the memory store.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorizeTool;

#[derive(Deserialize)]
struct MemorizeArgs {
    memory: String,
}

#[async_trait::async_trait]
impl Tool for MemorizeTool {
    fn name(&self) -> String {
        MEMORIZE_TOOL_NAME.to_string()
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            MEMORIZE_TOOL_NAME,
            "Saves the `memory` and returns it.",
            json!({
                "type": "object",
                "properties": {
                    "memory": {
                        "type": "string",
                        "description": "A memory synthesized from a user's input. This should just be a single sentence describing what should be memorized. For example, you might want to save something like \"User is tall\", \"User likes golf\", etc."
                    }
                },
                "required": ["memory"]
            }),
        )
    }

    async fn call(&self, context: &ToolContext, arguments: Value) -> Result<ToolOutput> {
        let args: MemorizeArgs = serde_json::from_value(arguments).map_err(|err| {
            Error::tool(format!("invalid arguments: {err}"), MEMORIZE_TOOL_NAME)
        })?;
        let memory = args.memory.trim().to_string();
        if memory.is_empty() {
            return Err(Error::tool("memory must not be empty", MEMORIZE_TOOL_NAME));
        }
        let memories = context.memories.append(memory.clone())?;
        debug!(count = memories.len(), "memory saved");
        Ok(ToolOutput {
            value: Value::String(memory.clone()),
            memory: Some(memory),
            memories: Some(memories),
        })
    }
}

/////////////////////////////////////////// ToolRegistry ///////////////////////////////////////////

/// The set of tools offered to the model, looked up by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in tools.
    pub fn with_defaults() -> Self {
        Self::new().with_tool(MemorizeTool)
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        self.tools.retain(|existing| existing.name() != name);
        self.tools.push(tool);
    }

    /// Find the tool bound to `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name).cloned()
    }

    /// Definitions for every registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|tool| tool.name()))
            .finish()
    }
}

//////////////////////////////////////// ToolCallAccumulator ////////////////////////////////////////

#[derive(Debug, Clone)]
struct PendingCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// A reassembled tool call whose arguments parsed as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    /// The call as it will be recorded in history.
    pub call: ToolCallRef,
    /// The parsed arguments object.
    pub arguments: Value,
}

/// Reassembles streamed tool call fragments into complete calls.
///
/// Fragments are keyed by the call's index within the assistant message, so
/// fragments of different calls may interleave.  Calls complete together
/// when the stream signals its end.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PendingCall>,
    content: String,
    finished: bool,
}

impl ToolCallAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in.  Returns true once the terminal signal was seen.
    pub fn accept(&mut self, chunk: &ChatCompletionChunk) -> bool {
        for delta in chunk.tool_call_deltas() {
            let position = match self.calls.iter().position(|call| call.index == delta.index) {
                Some(position) => position,
                None => {
                    self.calls.push(PendingCall {
                        index: delta.index,
                        id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                    self.calls.len() - 1
                }
            };
            let pending = &mut self.calls[position];
            if let Some(id) = delta.id.as_deref()
                && !id.is_empty()
            {
                pending.id = id.to_string();
            }
            if let Some(function) = &delta.function {
                if let Some(name) = function.name.as_deref()
                    && pending.name.is_empty()
                {
                    pending.name = name.to_string();
                }
                if let Some(arguments) = function.arguments.as_deref() {
                    pending.arguments.push_str(arguments);
                }
            }
        }
        if let Some(text) = chunk.text() {
            self.content.push_str(text);
        }
        if chunk.finish_reason().is_some() {
            self.finished = true;
        }
        self.finished
    }

    /// Returns true once the terminal signal was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of distinct calls seen so far.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns true if no tool call fragments were seen.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Reply text that arrived alongside the tool calls.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Complete every call, in order of first appearance.
    ///
    /// Each call's argument text must parse as a JSON object; empty text
    /// counts as `{}`.  The first call that fails to parse fails the batch.
    pub fn finish(self) -> Result<Vec<CompletedCall>> {
        self.calls
            .into_iter()
            .map(|pending| {
                let id = if pending.id.is_empty() {
                    format!("call_{}", pending.index)
                } else {
                    pending.id
                };
                let text = if pending.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    pending.arguments
                };
                let arguments: Value = serde_json::from_str(&text).map_err(|err| {
                    Error::tool_arguments(err.to_string(), id.clone(), pending.name.clone())
                })?;
                if !arguments.is_object() {
                    return Err(Error::tool_arguments(
                        "arguments must be a JSON object",
                        id,
                        pending.name,
                    ));
                }
                Ok(CompletedCall {
                    call: ToolCallRef::new(id, pending.name, text),
                    arguments,
                })
            })
            .collect()
    }
}

///////////////////////////////////////////// ToolResult /////////////////////////////////////////////

/// The outcome of running one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// The call this result answers.
    pub call_id: String,
    /// The function that was called.
    pub function_name: String,
    /// The value reported back to the model.
    pub return_value: Value,
    /// True if the call failed and `return_value` describes the failure.
    pub is_error: bool,
    /// A fact the tool persisted, if any.
    pub memory: Option<String>,
    /// The full memory list after the tool persisted a fact.
    pub memories: Option<MemoryList>,
}

impl ToolResult {
    fn error(call: &ToolCallRef, message: String) -> Self {
        Self {
            call_id: call.id.clone(),
            function_name: call.function_name().to_string(),
            return_value: Value::String(message),
            is_error: true,
            memory: None,
            memories: None,
        }
    }

    /// The tool message that reports this result to the model.
    pub fn to_message(&self) -> Message {
        let content = match &self.return_value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Message::tool(self.call_id.clone(), self.function_name.clone(), content)
    }
}

///////////////////////////////////////////// ToolInvoker /////////////////////////////////////////////

/// Runs completed tool calls against a registry.
pub struct ToolInvoker<'a> {
    registry: &'a ToolRegistry,
    context: &'a ToolContext,
}

impl<'a> ToolInvoker<'a> {
    /// Create an invoker over `registry`.
    pub fn new(registry: &'a ToolRegistry, context: &'a ToolContext) -> Self {
        Self { registry, context }
    }

    /// Run one call.
    ///
    /// Unknown tools and tool failures become error results that the model
    /// gets to see.  Persistence failures abort the turn.
    pub async fn invoke(&self, completed: &CompletedCall) -> Result<ToolResult> {
        let call = &completed.call;
        SESSION_TOOL_CALLS.click();
        let Some(tool) = self.registry.get(call.function_name()) else {
            warn!(name = call.function_name(), "model called an unknown tool");
            SESSION_TOOL_ERRORS.click();
            return Ok(ToolResult::error(
                call,
                format!("{} not found", call.function_name()),
            ));
        };
        match tool.call(self.context, completed.arguments.clone()).await {
            Ok(output) => Ok(ToolResult {
                call_id: call.id.clone(),
                function_name: call.function_name().to_string(),
                return_value: output.value,
                is_error: false,
                memory: output.memory,
                memories: output.memories,
            }),
            Err(err) if err.is_persistence() => {
                SESSION_TOOL_ERRORS.click();
                Err(err)
            }
            Err(err) => {
                warn!(name = call.function_name(), "tool failed: {err}");
                SESSION_TOOL_ERRORS.click();
                Ok(ToolResult::error(call, err.to_string()))
            }
        }
    }
}
