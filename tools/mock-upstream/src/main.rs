use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Tools,
    Garbled,
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Tools => "tools",
            MockScenario::Garbled => "garbled",
            MockScenario::Error => "error",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    chat_requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        chat_requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock upstream listening on 127.0.0.1:{port} (scenario={})",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("tools") => MockScenario::Tools,
        Ok("garbled") => MockScenario::Garbled,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &MockState) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    drain_request_body(body).await;

    match (parts.method, parts.uri.path()) {
        (Method::GET, "/models") => {
            simple_response_static(StatusCode::OK, "application/json", MODELS_LISTING)
        }
        (Method::GET, "/_mock/stats") => stats_response(state),
        (Method::POST, "/chat") => {
            state.chat_requests.fetch_add(1, Ordering::Relaxed);
            chat_response(state.scenario)
        }
        (Method::GET | Method::POST, _) => simple_response_static(
            StatusCode::NOT_FOUND,
            "application/json",
            br#"{"error":{"message":"not_found"}}"#,
        ),
        _ => simple_response_static(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            br#"{"error":{"message":"method_not_allowed"}}"#,
        ),
    }
}

async fn drain_request_body(mut body: Incoming) {
    while let Some(frame_result) = body.frame().await {
        if frame_result.is_err() {
            break;
        }
    }
}

fn stats_response(state: &MockState) -> Response<Full<Bytes>> {
    let body = format!(
        "{{\"scenario\":\"{}\",\"chat_requests\":{}}}",
        state.scenario.as_str(),
        state.chat_requests.load(Ordering::Relaxed)
    );
    simple_response(
        StatusCode::OK,
        "application/json",
        Bytes::from(body.into_bytes()),
    )
}

fn chat_response(scenario: MockScenario) -> Response<Full<Bytes>> {
    let body = match scenario {
        MockScenario::Text => STREAM_TEXT,
        MockScenario::Tools => STREAM_TOOLS,
        MockScenario::Garbled => STREAM_GARBLED,
        MockScenario::Error => {
            return simple_response_static(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                br#"{"error":{"message":"mock_injected_error"}}"#,
            );
        }
    };
    let mut response = simple_response_static(StatusCode::OK, "text/event-stream", body);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn simple_response_static(
    status: StatusCode,
    content_type: &'static str,
    body: &'static [u8],
) -> Response<Full<Bytes>> {
    simple_response(status, content_type, Bytes::from_static(body))
}

const MODELS_LISTING: &[u8] = br#"{"data":[{"id":"mock-small","provider":"mock","name":"mock-small-v1"},{"id":"mock-large","provider":"mock","name":"mock-large-v2"}]}"#;

const STREAM_TEXT: &[u8] = b"data: {\"text\":\"Hel\"}\n\ndata: {\"text\":\"lo\"}\n\ndata: {\"text\":\"\",\"finish_reason\":\"stop\"}\n\ndata: [DONE]\n\n";
const STREAM_TOOLS: &[u8] = b"data: {\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\"}}]}\n\ndata: {\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]}\n\ndata: {\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Paris\\\"}\"}}]}\n\ndata: {\"finish_reason\":\"tool_calls\",\"tool_calls\":[{\"id\":\"call_1\",\"name\":\"get_weather\",\"arguments\":\"{\\\"city\\\":\\\"Paris\\\"}\"}]}\n\ndata: [DONE]\n\n";
const STREAM_GARBLED: &[u8] = b"data: {\"text\":\"still \"}\n\ndata: {not json\n\ndata: {\"text\":\"here\"}\n\n";
