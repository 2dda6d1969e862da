use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use chat_relay::error::RelayError;
use chat_relay::protocol::{ChatCompletionChunk, FinishReason};
use chat_relay::stream::{
    aggregate_stream, data_frame_stream, encode_chunk, transcode_stream, ChunkEmitter,
};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

const SEED: u128 = 0x0123_4567_89ab_cdef_0011_2233_4455_6677;

fn emitter() -> ChunkEmitter {
    ChunkEmitter::new("gpt-4o", 1_700_000_000, uuid::Uuid::from_u128(SEED))
}

fn wire(records: &[Value]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str("data: ");
        out.push_str(&record.to_string());
        out.push_str("\n\n");
    }
    out
}

/// Split `text` into byte pieces of at most `piece` bytes, ignoring char boundaries.
fn byte_source(
    text: &str,
    piece: usize,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + Unpin + 'static {
    let chunks: Vec<Result<Bytes, Infallible>> = text
        .as_bytes()
        .chunks(piece)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures_util::stream::iter(chunks)
}

/// Parsed downstream chunks, the number of `[DONE]` records, and the trailing error if any.
async fn run_streaming<S>(source: S) -> (Vec<Value>, usize, Option<RelayError>)
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let items: Vec<Result<Bytes, RelayError>> =
        transcode_stream(source, emitter()).collect().await;
    let mut chunks = Vec::new();
    let mut done = 0;
    for (position, item) in items.iter().enumerate() {
        let Ok(bytes) = item else {
            continue;
        };
        let text = std::str::from_utf8(bytes).unwrap();
        let payload = text
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        if payload == "[DONE]" {
            assert_eq!(position, items.len() - 1, "[DONE] must be last");
            done += 1;
        } else {
            chunks.push(serde_json::from_str(payload).unwrap());
        }
    }
    let error = items.into_iter().last().and_then(Result::err);
    (chunks, done, error)
}

fn hello_records() -> Vec<Value> {
    vec![
        json!({"text": "Hel"}),
        json!({"text": "lo"}),
        json!({"text": "", "finish_reason": "stop"}),
    ]
}

fn weather_records() -> Vec<Value> {
    vec![
        json!({"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "get_weather"}}]}),
        json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"loc"}}]}),
        json!({"tool_calls": [{"index": 0, "function": {"arguments": "\":\"NY\"}"}}]}),
        json!({
            "finish_reason": "tool_calls",
            "tool_calls": [{"id": "call_1", "name": "get_weather", "arguments": "{\"loc\":\"NY\"}"}]
        }),
    ]
}

#[tokio::test]
async fn test_text_sequence_streams_three_chunks_then_done() {
    let (chunks, done, error) = run_streaming(byte_source(&wire(&hello_records()), 64)).await;
    assert!(error.is_none());
    assert_eq!(done, 1);
    assert_eq!(chunks.len(), 3);

    assert_eq!(
        chunks[0]["choices"][0]["delta"],
        json!({"role": "assistant", "content": "Hel"})
    );
    assert_eq!(chunks[1]["choices"][0]["delta"], json!({"content": "lo"}));
    assert_eq!(chunks[2]["choices"][0]["delta"], json!({}));
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");

    for chunk in &chunks {
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "gpt-4o");
        assert_eq!(chunk["created"], 1_700_000_000);
        assert_eq!(chunk["choices"][0]["index"], 0);
        assert!(chunk["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }
    assert!(chunks[0]["choices"][0]["finish_reason"].is_null());
}

#[tokio::test]
async fn test_text_sequence_aggregates_to_hello() {
    let aggregated = aggregate_stream(byte_source(&wire(&hello_records()), 7))
        .await
        .unwrap();
    assert_eq!(aggregated.message.role, "assistant");
    assert_eq!(aggregated.message.content.as_deref(), Some("Hello"));
    assert!(aggregated.message.tool_calls.is_none());
    assert_eq!(aggregated.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_tool_call_sequence_streams_incremental_deltas() {
    let (chunks, done, error) = run_streaming(byte_source(&wire(&weather_records()), 16)).await;
    assert!(error.is_none());
    assert_eq!(done, 1);
    assert_eq!(chunks.len(), 4);

    let first = &chunks[0]["choices"][0]["delta"];
    assert_eq!(first["role"], "assistant");
    assert!(first.get("content").is_some_and(Value::is_null));
    assert_eq!(first["tool_calls"][0]["id"], "call_1");
    assert_eq!(first["tool_calls"][0]["type"], "function");
    assert_eq!(first["tool_calls"][0]["function"]["name"], "get_weather");

    for (chunk, fragment) in chunks[1..3].iter().zip(["{\"loc", "\":\"NY\"}"]) {
        let delta = &chunk["choices"][0]["delta"];
        assert!(delta.get("role").is_none());
        assert!(delta.get("content").is_none());
        let call = &delta["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert!(call.get("id").is_none());
        assert_eq!(call["function"], json!({"arguments": fragment}));
    }

    let last = &chunks[3]["choices"][0];
    assert_eq!(last["finish_reason"], "tool_calls");
    assert!(last["delta"].get("tool_calls").is_none());
}

#[tokio::test]
async fn test_tool_call_sequence_aggregates_single_call() {
    let aggregated = aggregate_stream(byte_source(&wire(&weather_records()), 5))
        .await
        .unwrap();
    assert_eq!(aggregated.finish_reason, FinishReason::ToolCalls);
    assert!(aggregated.message.content.is_none());
    let calls = aggregated.message.tool_calls.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].type_, "function");
    assert_eq!(calls[0].function.name, "get_weather");
    assert_eq!(calls[0].function.arguments, "{\"loc\":\"NY\"}");
}

#[tokio::test]
async fn test_streamed_content_concatenates_to_aggregated_content() {
    let records = vec![
        json!({"text": "The "}),
        json!({"text": "quick "}),
        json!({"text": ""}),
        json!({"text": "brown fox ü"}),
        json!({"text": "mps", "finish_reason": "length"}),
    ];
    let body = wire(&records);

    let (chunks, _, _) = run_streaming(byte_source(&body, 3)).await;
    let streamed: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();

    let aggregated = aggregate_stream(byte_source(&body, 11)).await.unwrap();
    assert_eq!(Some(streamed.as_str()), aggregated.message.content.as_deref());
    assert_eq!(aggregated.finish_reason, FinishReason::Length);
}

#[tokio::test]
async fn test_encoded_chunk_reads_back_through_frame_reader() {
    let mut emitter = emitter();
    let event = chat_relay::protocol::decode_upstream_event(r#"{"text":"héllo\nworld"}"#).unwrap();
    let chunk = emitter.emit(&event).unwrap();
    let encoded = encode_chunk(&chunk).unwrap();

    let source = futures_util::stream::iter(vec![Ok::<Bytes, Infallible>(encoded)]);
    let payloads: Vec<String> = data_frame_stream(source)
        .map(|payload| payload.unwrap())
        .collect()
        .await;
    assert_eq!(payloads.len(), 1);
    let back: ChatCompletionChunk = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(back, chunk);
}

#[tokio::test]
async fn test_unparsable_record_does_not_stop_the_sequence() {
    let body = "data: {\"text\":\"a\"}\n\ndata: {broken\n\ndata: {\"text\":\"b\"}\n\n";
    let (chunks, done, error) = run_streaming(byte_source(body, 4)).await;
    assert!(error.is_none());
    assert_eq!(done, 1);
    let texts: Vec<&str> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(texts, vec!["a", "b"]);
}

#[tokio::test]
async fn test_sequence_without_finish_reason_still_ends_cleanly() {
    let body = wire(&[json!({"text": "partial"})]);
    let (chunks, done, error) = run_streaming(byte_source(&body, 64)).await;
    assert!(error.is_none());
    assert_eq!(chunks.len(), 1);
    assert_eq!(done, 1);

    let aggregated = aggregate_stream(byte_source(&body, 64)).await.unwrap();
    assert_eq!(aggregated.finish_reason, FinishReason::Stop);
    assert_eq!(aggregated.message.content.as_deref(), Some("partial"));
}

#[tokio::test]
async fn test_upstream_done_marker_yields_single_done() {
    let body = format!("{}data: [DONE]\n\n", wire(&hello_records()));
    let (chunks, done, _) = run_streaming(byte_source(&body, 9)).await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(done, 1);
}

#[tokio::test]
async fn test_events_after_finish_reason_are_ignored() {
    let mut records = hello_records();
    records.push(json!({"text": "late"}));
    let (chunks, done, _) = run_streaming(byte_source(&wire(&records), 64)).await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(done, 1);
}

#[tokio::test]
async fn test_summary_only_record_streams_role_with_finish() {
    let body = wire(&[json!({
        "finish_reason": "tool_calls",
        "tool_calls": [{"id": "c1", "name": "f", "arguments": "{}"}]
    })]);
    let (chunks, done, error) = run_streaming(byte_source(&body, 64)).await;
    assert!(error.is_none());
    assert_eq!(done, 1);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(chunks[0]["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn test_streamed_and_aggregated_content_diverge_after_first_finish() {
    let body = wire(&[
        json!({"text": "a", "finish_reason": "stop"}),
        json!({"text": "b"}),
    ]);

    let (chunks, done, _) = run_streaming(byte_source(&body, 64)).await;
    let streamed: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(streamed, "a");
    assert_eq!(done, 1);

    let aggregated = aggregate_stream(byte_source(&body, 64)).await.unwrap();
    assert_eq!(aggregated.message.content.as_deref(), Some("ab"));
    assert_eq!(aggregated.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_split_multibyte_character_decodes() {
    let body = wire(&[json!({"text": "日本語"}), json!({"finish_reason": "stop"})]);
    let aggregated = aggregate_stream(byte_source(&body, 1)).await.unwrap();
    assert_eq!(aggregated.message.content.as_deref(), Some("日本語"));
}

#[tokio::test]
async fn test_trailing_unterminated_line_is_discarded() {
    let body = "data: {\"text\":\"kept\"}\n\ndata: {\"text\":\"lost\"}";
    let aggregated = aggregate_stream(byte_source(body, 64)).await.unwrap();
    assert_eq!(aggregated.message.content.as_deref(), Some("kept"));
}

#[tokio::test]
async fn test_transport_error_mid_stream_yields_error_and_no_done() {
    let source = futures_util::stream::iter(vec![
        Ok(Bytes::from_static(b"data: {\"text\":\"a\"}\n\n")),
        Err("connection reset"),
        Ok(Bytes::from_static(b"data: {\"text\":\"b\"}\n\n")),
    ]);
    let items: Vec<Result<Bytes, RelayError>> = transcode_stream(source, emitter()).collect().await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(matches!(items[1], Err(RelayError::Transport(_))));
    assert!(items
        .iter()
        .filter_map(|item| item.as_ref().ok())
        .all(|bytes| bytes.as_ref() != b"data: [DONE]\n\n"));

    let failing = futures_util::stream::iter(vec![
        Ok(Bytes::from_static(b"data: {\"text\":\"a\"}\n\n")),
        Err("connection reset"),
    ]);
    assert!(matches!(
        aggregate_stream(failing).await,
        Err(RelayError::Transport(_))
    ));
}

struct CountDrops<S> {
    inner: S,
    drops: Arc<AtomicUsize>,
}

impl<S> Drop for CountDrops<S> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: Stream + Unpin> Stream for CountDrops<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[tokio::test]
async fn test_source_released_once_when_consumer_drops_early() {
    let drops = Arc::new(AtomicUsize::new(0));
    let source = CountDrops {
        inner: byte_source(&wire(&hello_records()), 8),
        drops: Arc::clone(&drops),
    };
    let mut stream = Box::pin(transcode_stream(source, emitter()));
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(stream);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_source_released_once_on_clean_end() {
    let drops = Arc::new(AtomicUsize::new(0));
    let source = CountDrops {
        inner: byte_source(&wire(&hello_records()), 8),
        drops: Arc::clone(&drops),
    };
    let stream = transcode_stream(source, emitter());
    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 4);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
