use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, warn};

use super::sse::openai_sse_frame;
use super::tool_calls::ToolCallDeltaTracker;
use crate::error::RelayError;
use crate::protocol::downstream::{ASSISTANT_ROLE, CHUNK_OBJECT};
use crate::protocol::{ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason, UpstreamEvent};

/// Per-request emitter phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterPhase {
    /// Nothing carrying content or a tool call has been emitted; the role is
    /// still owed.
    AwaitingFirstContent,
    Streaming,
    /// A finish reason was emitted; later events produce nothing.
    Finished,
}

/// Maps decoded upstream events to client chunks, one request at a time.
#[derive(Debug)]
pub struct ChunkEmitter {
    model: String,
    created: u64,
    id_seed: u128,
    phase: EmitterPhase,
    tracker: ToolCallDeltaTracker,
    finish_reason: Option<FinishReason>,
    chunks: u64,
    late_events: u64,
    started: Instant,
}

impl ChunkEmitter {
    /// `model` is the identifier the caller asked for; every chunk echoes it.
    #[must_use]
    pub fn new(model: impl Into<String>, created: u64, id_seed: uuid::Uuid) -> Self {
        Self {
            model: model.into(),
            created,
            id_seed: id_seed.as_u128(),
            phase: EmitterPhase::AwaitingFirstContent,
            tracker: ToolCallDeltaTracker::new(),
            finish_reason: None,
            chunks: 0,
            late_events: 0,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> EmitterPhase {
        self.phase
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish_reason.as_ref()
    }

    #[must_use]
    pub fn chunks_emitted(&self) -> u64 {
        self.chunks
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Build the chunk for `event`, or `None` when it contributes nothing.
    pub fn emit(&mut self, event: &UpstreamEvent) -> Option<ChatCompletionChunk> {
        if self.phase == EmitterPhase::Finished {
            self.late_events += 1;
            if self.late_events == 1 {
                warn!(
                    model = %self.model,
                    "upstream kept sending after a finish reason; ignoring late events"
                );
            } else {
                debug!(late_events = self.late_events, "ignoring late upstream event");
            }
            return None;
        }

        let tool_calls = self.tracker.track(event);
        let has_text = event.text.as_deref().is_some_and(|text| !text.is_empty());

        // Any raw fragment opens the assistant turn, even a withheld summary.
        let mut delta = ChunkDelta::default();
        if self.phase == EmitterPhase::AwaitingFirstContent
            && (has_text || !event.tool_calls.is_empty())
        {
            delta.role = Some(ASSISTANT_ROLE.to_string());
            self.phase = EmitterPhase::Streaming;
        }

        if !tool_calls.is_empty() {
            if delta.role.is_some() {
                delta.content = Some(None);
            }
            delta.tool_calls = tool_calls;
        } else if let Some(text) = event.text.as_deref() {
            let vacuous_terminal = text.is_empty() && event.finish_reason.is_some();
            if !vacuous_terminal {
                delta.content = Some(Some(text.to_string()));
            }
        }

        let finish_reason = event.finish_reason.clone();
        if let Some(reason) = &finish_reason {
            self.phase = EmitterPhase::Finished;
            self.finish_reason = Some(reason.clone());
        }

        if delta.is_empty() && finish_reason.is_none() {
            return None;
        }
        Some(self.chunk(delta, finish_reason))
    }

    fn chunk(
        &mut self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
    ) -> ChatCompletionChunk {
        self.chunks += 1;
        let uuid = uuid::Uuid::from_u128(self.id_seed ^ (u128::from(self.chunks) << 64));
        ChatCompletionChunk {
            id: format!("chatcmpl-{}", uuid.simple()),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Number of tool-call fragments the tracker had to skip.
    #[must_use]
    pub fn dropped_fragments(&self) -> usize {
        self.tracker.dropped()
    }
}

/// Serialize a chunk as one SSE record.
///
/// # Errors
///
/// Returns [`RelayError::Internal`] if the chunk cannot be serialized.
pub fn encode_chunk(chunk: &ChatCompletionChunk) -> Result<Bytes, RelayError> {
    let json = serde_json::to_string(chunk)
        .map_err(|err| RelayError::Internal(format!("failed to encode chunk: {err}")))?;
    Ok(Bytes::from(openai_sse_frame(&json)))
}
