pub mod downstream;
pub mod upstream;

pub use downstream::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkChoice, ChunkDelta,
    ChunkFunction, ChunkToolCall, FinalFunction, FinalMessage, FinalToolCall, ResponseChoice,
    UpstreamRequest, Usage, ASSISTANT_ROLE, CHUNK_OBJECT, COMPLETION_OBJECT, FUNCTION_TYPE,
};
pub use upstream::{
    decode_upstream_event, FinishReason, ToolCallDelta, ToolCallFragment, ToolCallSummary,
    UpstreamEvent,
};
