//! Eddie: a streaming chat assistant that remembers things about you.
//!
//! The crate is built around [`SessionEngine`], which runs conversation turns
//! against any [`CompletionEndpoint`].  [`CompletionClient`] is the endpoint
//! for OpenAI-compatible HTTP servers.  Facts the assistant decides to keep are
//! saved through the `Memorize` tool into a [`MemoryStore`] and shown to the
//! model at the start of every request.
//!
//! ```no_run
//! # async fn run() -> eddie::Result<()> {
//! use std::sync::atomic::AtomicBool;
//! use eddie::{CompletionClient, MemoryStore, SessionConfig, SessionEngine};
//!
//! let client = CompletionClient::new(None)?;
//! let store = MemoryStore::open_default()?;
//! let mut session = SessionEngine::new(client, store, SessionConfig::default())?;
//! let interrupted = AtomicBool::new(false);
//! let reply = session
//!     .chat_with("I just got back from golf.", |chunk| print!("{chunk}"), |_| {}, &interrupted)
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod client;
pub mod commands;
pub mod config;
pub mod decoder;
pub mod error;
pub mod history;
pub mod memory;
pub mod prompt;
pub mod retry;
pub mod session;
pub mod tools;
pub mod types;

mod observability;
mod sse;

// Re-exports
pub use client::{ChunkStream, CompletionClient, CompletionEndpoint, DEFAULT_API_URL};
pub use config::{EddieArgs, EddieConfig};
pub use decoder::{DecodedStream, Replay, decode};
pub use error::{Error, Result};
pub use history::{ConversationHistory, DEFAULT_HISTORY_LIMIT};
pub use memory::{MemoryList, MemoryStore};
pub use observability::register_biometrics;
pub use prompt::SystemPrompt;
pub use retry::RetryPolicy;
pub use session::{FnHandler, SessionConfig, SessionEngine, SessionStats, TurnHandler};
pub use tools::{
    CompletedCall, MEMORIZE_TOOL_NAME, MemorizeTool, Tool, ToolCallAccumulator, ToolContext,
    ToolInvoker, ToolOutput, ToolRegistry, ToolResult,
};
pub use types::*;
