//! The conversation turn engine.
//!
//! A [`SessionEngine`] owns the conversation history, the memory snapshot and
//! the tool registry for one conversation.  Each call to
//! [`SessionEngine::chat`] runs one user turn: it streams a completion,
//! forwards reply text to a [`TurnHandler`] as it arrives, and when the model
//! asks for tools instead, runs them and asks again.  Messages produced during
//! a turn are staged and only committed to history once the turn resolves, so
//! a failed or interrupted turn leaves the history exactly as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::{Stream, StreamExt};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::client::CompletionEndpoint;
use crate::decoder::{DecodedStream, Replay, decode};
use crate::error::{Error, Result};
use crate::history::{ConversationHistory, DEFAULT_HISTORY_LIMIT};
use crate::memory::{MemoryList, MemoryStore};
use crate::observability::{SESSION_TURN_DURATION, SESSION_TURN_ERRORS, SESSION_TURNS};
use crate::prompt::{DEFAULT_FIRST_MESSAGE, DEFAULT_PERSONA, SystemPrompt};
use crate::tools::{ToolCallAccumulator, ToolContext, ToolInvoker, ToolRegistry, ToolResult};
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, Message};

/// Default model name.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Default number of tool rounds allowed within one turn.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 5;

/////////////////////////////////////////// SessionConfig ///////////////////////////////////////////

/// Settings for a [`SessionEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// The model to request completions from.
    pub model: String,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional cap on tokens per completion.
    pub max_tokens: Option<u32>,
    /// Messages kept in history between turns.
    pub history_limit: usize,
    /// Tool rounds allowed before a turn gives up.
    pub max_tool_iterations: usize,
    /// The persona at the head of the system instructions.
    pub persona: String,
    /// The greeting the assistant opens with.
    pub first_message: String,
}

impl SessionConfig {
    /// Creates a config with default values.
    ///
    /// Defaults:
    /// - Model: gpt-4o
    /// - History limit: 30 messages
    /// - Tool rounds per turn: 5
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            persona: DEFAULT_PERSONA.to_string(),
            first_message: DEFAULT_FIRST_MESSAGE.to_string(),
        }
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the per-completion token cap.
    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the number of messages kept in history.
    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    /// Sets the number of tool rounds allowed per turn.
    pub fn with_max_tool_iterations(mut self, max_tool_iterations: usize) -> Self {
        self.max_tool_iterations = max_tool_iterations;
        self
    }

    /// Sets the persona.
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    /// Sets the first message.
    pub fn with_first_message(mut self, first_message: impl Into<String>) -> Self {
        self.first_message = first_message.into();
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////////// TurnHandler ////////////////////////////////////////////

/// Receives the visible output of a turn as it happens.
pub trait TurnHandler {
    /// Called with each piece of reply text, in order.
    fn on_chunk(&mut self, chunk: &str);

    /// Called with each fact the assistant saved during the turn.
    fn on_memory(&mut self, memory: &str) {
        let _ = memory;
    }
}

/// A [`TurnHandler`] built from two closures.
pub struct FnHandler<C, M> {
    on_chunk: C,
    on_memory: M,
}

impl<C, M> FnHandler<C, M>
where
    C: FnMut(&str),
    M: FnMut(&str),
{
    /// Wrap the two callbacks.
    pub fn new(on_chunk: C, on_memory: M) -> Self {
        Self {
            on_chunk,
            on_memory,
        }
    }
}

impl<C, M> TurnHandler for FnHandler<C, M>
where
    C: FnMut(&str),
    M: FnMut(&str),
{
    fn on_chunk(&mut self, chunk: &str) {
        (self.on_chunk)(chunk)
    }

    fn on_memory(&mut self, memory: &str) {
        (self.on_memory)(memory)
    }
}

//////////////////////////////////////////// SessionStats ///////////////////////////////////////////

/// A snapshot of session counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// The model used for the session.
    pub model: String,
    /// The number of messages in history.
    pub message_count: usize,
    /// The number of saved memories.
    pub memory_count: usize,
    /// Completion requests made, including tool continuations.
    pub total_requests: u64,
    /// Tool calls run.
    pub total_tool_calls: u64,
    /// Turns that completed successfully.
    pub total_turns: u64,
}

/////////////////////////////////////////// SessionEngine ///////////////////////////////////////////

/// Runs conversation turns against a completion endpoint.
pub struct SessionEngine<E: CompletionEndpoint> {
    endpoint: E,
    config: SessionConfig,
    prompt: SystemPrompt,
    tools: ToolRegistry,
    context: ToolContext,
    history: ConversationHistory,
    memories: MemoryList,
    total_requests: u64,
    total_tool_calls: u64,
    total_turns: u64,
}

impl<E: CompletionEndpoint> SessionEngine<E> {
    /// Create an engine offering the built-in tools.
    ///
    /// The memory store is loaded (and created if missing) up front.
    pub fn new(endpoint: E, store: MemoryStore, config: SessionConfig) -> Result<Self> {
        let memories = store.load()?;
        debug!(path = %store.path().display(), count = memories.len(), "memories loaded");
        Ok(Self {
            endpoint,
            prompt: SystemPrompt::new(config.persona.clone(), config.first_message.clone()),
            history: ConversationHistory::new(config.history_limit),
            config,
            tools: ToolRegistry::with_defaults(),
            context: ToolContext { memories: store },
            memories,
            total_requests: 0,
            total_tool_calls: 0,
            total_turns: 0,
        })
    }

    /// Replace the tools offered to the model.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the system prompt renderer.
    pub fn with_prompt(mut self, prompt: SystemPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Run one user turn and return the assistant's final reply.
    ///
    /// Reply text goes to `handler.on_chunk` as it streams in, and facts the
    /// assistant saves go to `handler.on_memory` as each tool call finishes.
    /// When `interrupted` is set the turn stops with [`Error::Abort`] before
    /// the next stream is opened or the next fragment is read.  On any error
    /// the history is left unchanged.
    pub async fn chat(
        &mut self,
        input: &str,
        handler: &mut dyn TurnHandler,
        interrupted: &AtomicBool,
    ) -> Result<String> {
        let start = Instant::now();
        SESSION_TURNS.click();
        let outcome = self.run_turn(input, handler, interrupted).await;
        SESSION_TURN_DURATION.add(start.elapsed().as_secs_f64());
        match outcome {
            Ok((reply, staged)) => {
                debug!(messages = staged.len(), "committing turn");
                self.history.commit_turn(staged);
                self.total_turns += 1;
                Ok(reply)
            }
            Err(err) => {
                SESSION_TURN_ERRORS.click();
                if err.is_abort() {
                    info!("turn interrupted");
                } else {
                    warn!("turn failed: {err}");
                }
                Err(err)
            }
        }
    }

    /// Like [`SessionEngine::chat`], with closures for the callbacks.
    pub async fn chat_with<C, M>(
        &mut self,
        input: &str,
        on_chunk: C,
        on_memory: M,
        interrupted: &AtomicBool,
    ) -> Result<String>
    where
        C: FnMut(&str),
        M: FnMut(&str),
    {
        let mut handler = FnHandler::new(on_chunk, on_memory);
        self.chat(input, &mut handler, interrupted).await
    }

    async fn run_turn(
        &mut self,
        input: &str,
        handler: &mut dyn TurnHandler,
        interrupted: &AtomicBool,
    ) -> Result<(String, Vec<Message>)> {
        let mut staged = vec![Message::user(input)];
        let max_rounds = self.config.max_tool_iterations;
        for round in 0..=max_rounds {
            check_interrupt(interrupted)?;
            let request = self.build_request(&staged);
            self.total_requests += 1;
            debug!(round, messages = request.messages.len(), "opening completion stream");
            let stream = self.endpoint.stream(request).await?;
            check_interrupt(interrupted)?;
            match decode(stream).await? {
                DecodedStream::Content(replay) => {
                    let reply = stream_content(replay, handler, interrupted).await?;
                    staged.push(Message::assistant(reply.clone()));
                    return Ok((reply, staged));
                }
                DecodedStream::ToolCalls(replay) => {
                    let accumulator = accumulate_tool_calls(replay, interrupted).await?;
                    if accumulator.is_empty() {
                        let reply = accumulator.content().to_string();
                        if !reply.is_empty() {
                            handler.on_chunk(&reply);
                        }
                        staged.push(Message::assistant(reply.clone()));
                        return Ok((reply, staged));
                    }
                    if round >= max_rounds {
                        return Err(Error::tool_loop(max_rounds));
                    }
                    let preamble = accumulator.content().to_string();
                    let calls = accumulator.finish()?;
                    let invoker = ToolInvoker::new(&self.tools, &self.context);
                    let mut results: Vec<ToolResult> = Vec::with_capacity(calls.len());
                    for call in &calls {
                        debug!(id = %call.call.id, name = call.call.function_name(), "running tool");
                        let result = invoker.invoke(call).await?;
                        self.total_tool_calls += 1;
                        if let Some(memories) = &result.memories {
                            self.memories = memories.clone();
                        }
                        if let Some(memory) = &result.memory {
                            info!(count = self.memories.len(), "memory saved");
                            handler.on_memory(memory);
                        }
                        results.push(result);
                    }
                    let mut request_message = Message::assistant_tool_calls(
                        calls.into_iter().map(|completed| completed.call).collect(),
                    );
                    if !preamble.is_empty() {
                        request_message.content = Some(preamble);
                    }
                    staged.push(request_message);
                    staged.extend(results.iter().map(ToolResult::to_message));
                }
            }
        }
        Err(Error::tool_loop(max_rounds))
    }

    fn build_request(&self, staged: &[Message]) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(self.history.len() + staged.len() + 1);
        messages.push(Message::system(
            self.prompt.render(OffsetDateTime::now_utc(), &self.memories),
        ));
        messages.extend(self.history.messages().iter().cloned());
        messages.extend(staged.iter().cloned());
        ChatCompletionRequest::new(self.config.model.clone(), messages)
            .with_tools(self.tools.definitions())
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
    }

    /// Reload the memories from the store and return them.
    pub fn load_memories(&mut self) -> Result<Vec<String>> {
        self.memories = self.context.memories.load()?;
        Ok(self.memories.clone())
    }

    /// The cached memory list.
    pub fn memories(&self) -> &[String] {
        &self.memories
    }

    /// Delete the memory at zero-based `index`.
    pub fn delete_memory(&mut self, index: usize) -> Result<()> {
        self.memories = self.context.memories.delete(index)?;
        info!(index, remaining = self.memories.len(), "memory deleted");
        Ok(())
    }

    /// The memory store backing this session.
    pub fn store(&self) -> &MemoryStore {
        &self.context.memories
    }

    /// The conversation history.
    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Drop the conversation history.  Memories are kept.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// The greeting shown when the session starts.
    pub fn first_message(&self) -> &str {
        self.prompt.first_message()
    }

    /// The active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The current model.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Change the model used for later turns.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.config.model = model.into();
    }

    /// Returns the current session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            model: self.config.model.clone(),
            message_count: self.history.len(),
            memory_count: self.memories.len(),
            total_requests: self.total_requests,
            total_tool_calls: self.total_tool_calls,
            total_turns: self.total_turns,
        }
    }
}

fn check_interrupt(interrupted: &AtomicBool) -> Result<()> {
    if interrupted.load(Ordering::SeqCst) {
        Err(Error::abort("turn interrupted by user"))
    } else {
        Ok(())
    }
}

async fn stream_content<S>(
    mut replay: Replay<S>,
    handler: &mut dyn TurnHandler,
    interrupted: &AtomicBool,
) -> Result<String>
where
    S: Stream<Item = Result<ChatCompletionChunk>> + Unpin,
{
    let mut reply = String::new();
    loop {
        check_interrupt(interrupted)?;
        let Some(chunk) = replay.next().await else {
            break;
        };
        let chunk = chunk?;
        if !chunk.tool_call_deltas().is_empty() {
            return Err(Error::streaming(
                "tool call fragments arrived in a content stream",
                None,
            ));
        }
        if let Some(text) = chunk.text()
            && !text.is_empty()
        {
            handler.on_chunk(text);
            reply.push_str(text);
        }
    }
    Ok(reply)
}

async fn accumulate_tool_calls<S>(
    mut replay: Replay<S>,
    interrupted: &AtomicBool,
) -> Result<ToolCallAccumulator>
where
    S: Stream<Item = Result<ChatCompletionChunk>> + Unpin,
{
    let mut accumulator = ToolCallAccumulator::new();
    loop {
        check_interrupt(interrupted)?;
        let Some(chunk) = replay.next().await else {
            break;
        };
        accumulator.accept(&chunk?);
    }
    Ok(accumulator)
}
