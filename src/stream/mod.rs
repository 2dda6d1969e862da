//! The event-stream transcoder.
//!
//! Frame Reader ([`sse`]) → Event Decoder ([`crate::protocol::upstream`]) →
//! either the Chunk Emitter ([`emitter`], streaming) or the Aggregator
//! ([`aggregate`], buffered), with the Tool-Call Delta Tracker
//! ([`tool_calls`]) deciding what each streaming delta carries. All state
//! here is per request.

pub mod aggregate;
pub mod emitter;
pub mod sse;
pub mod tool_calls;
pub mod transcoder;

pub use aggregate::{AggregatedMessage, Aggregator};
pub use emitter::{encode_chunk, ChunkEmitter, EmitterPhase};
pub use sse::{
    data_frame_stream, done_frame, Frame, FrameReader, LineFramer, ReleaseReason, Utf8Decoder,
};
pub use tool_calls::ToolCallDeltaTracker;
pub use transcoder::{aggregate_stream, transcode_stream};
