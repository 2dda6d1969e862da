use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, info, warn};

use super::aggregate::{AggregatedMessage, Aggregator};
use super::emitter::{encode_chunk, ChunkEmitter};
use super::sse::{data_frame_stream, done_frame, FrameReader};
use crate::error::RelayError;
use crate::protocol::decode_upstream_event;
use crate::util::elapsed_ms;

/// Streaming mode: upstream bytes in, client SSE records out.
///
/// Records are produced strictly in upstream order and only as fast as the
/// consumer pulls. A clean end (upstream exhausted or `[DONE]`) yields the
/// `[DONE]` record exactly once, last. A transport failure yields one
/// [`RelayError::Transport`] item instead and ends the stream without
/// `[DONE]`, so the body aborts rather than closing cleanly. Dropping the
/// returned stream releases the upstream source.
pub fn transcode_stream<S, E>(
    byte_stream: S,
    emitter: ChunkEmitter,
) -> impl Stream<Item = Result<Bytes, RelayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    futures_util::stream::unfold(
        Some((data_frame_stream(byte_stream), emitter)),
        |state: Option<(FrameReader<S>, ChunkEmitter)>| async move {
            let (mut frames, mut emitter) = state?;
            loop {
                match frames.next().await {
                    Some(Ok(payload)) => {
                        let Some(event) = decode_upstream_event(&payload) else {
                            continue;
                        };
                        let Some(chunk) = emitter.emit(&event) else {
                            continue;
                        };
                        return match encode_chunk(&chunk) {
                            Ok(bytes) => Some((Ok(bytes), Some((frames, emitter)))),
                            Err(err) => Some((Err(err), None)),
                        };
                    }
                    Some(Err(err)) => {
                        warn!(
                            model = %emitter.model(),
                            chunks = emitter.chunks_emitted(),
                            error = %err,
                            "upstream stream failed mid-response"
                        );
                        return Some((Err(RelayError::Transport(err.to_string())), None));
                    }
                    None => {
                        log_stream_complete(&emitter);
                        return Some((Ok(done_frame()), None));
                    }
                }
            }
        },
    )
}

fn log_stream_complete(emitter: &ChunkEmitter) {
    if emitter.dropped_fragments() > 0 {
        debug!(
            dropped = emitter.dropped_fragments(),
            "tool-call fragments skipped while streaming"
        );
    }
    info!(
        model = %emitter.model(),
        mode = "stream",
        finish_reason = emitter.finish_reason().map_or("none", |reason| reason.as_str()),
        chunks = emitter.chunks_emitted(),
        elapsed_ms = elapsed_ms(emitter.elapsed()),
        "stream completed"
    );
}

/// Buffered mode: drain the whole upstream stream into one message.
///
/// # Errors
///
/// Returns [`RelayError::Transport`] when the byte source fails before the
/// sequence is exhausted.
pub async fn aggregate_stream<S, E>(byte_stream: S) -> Result<AggregatedMessage, RelayError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut frames = data_frame_stream(byte_stream);
    let mut aggregator = Aggregator::new();
    while let Some(frame) = frames.next().await {
        let payload = frame.map_err(|err| {
            warn!(error = %err, "upstream stream failed while aggregating");
            RelayError::Transport(err.to_string())
        })?;
        if let Some(event) = decode_upstream_event(&payload) {
            aggregator.push(event);
        }
    }
    Ok(aggregator.finish())
}
