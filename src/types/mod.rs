// Public modules
pub mod chat_completion_chunk;
pub mod chat_completion_request;
pub mod message;

// Re-exports
pub use chat_completion_chunk::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason, FunctionCallDelta, ToolCallDelta,
};
pub use chat_completion_request::{ChatCompletionRequest, FunctionDefinition, ToolDefinition};
pub use message::{FunctionCall, Message, MessageRole, ToolCallRef};
