use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{sanitize_upstream_error, RelayError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
    use_env_proxy: bool,
) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);

    if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Pooled HTTP client for the upstream provider.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with connection pooling and timeouts from the server config.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, RelayError> {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        let client = build_reqwest_client(
            config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            Duration::from_secs(config.timeout),
            config.http_use_env_proxy,
        )?;
        Ok(Self { client })
    }

    /// POST a JSON body and return the response whose body is the event stream.
    ///
    /// # Errors
    ///
    /// - `RelayError::Transport` when the request cannot be sent.
    /// - `RelayError::Upstream` for a non-success status, with a sanitised message.
    /// - `RelayError::MissingBody` when a success response declares an empty body.
    pub async fn post_stream(
        &self,
        url: &str,
        api_key: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, RelayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .body(body)
            .send()
            .await
            .map_err(|err| RelayError::Transport(format!("Upstream request failed: {err}")))?;

        let response = ensure_success(response).await?;
        if response.content_length() == Some(0) {
            return Err(RelayError::MissingBody);
        }
        Ok(response)
    }

    /// GET a JSON document and return its raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` or `RelayError::Upstream` as for
    /// [`HttpTransport::post_stream`].
    pub async fn get_json(&self, url: &str, api_key: &str) -> Result<Bytes, RelayError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| RelayError::Transport(format!("Upstream request failed: {err}")))?;
        let response = ensure_success(response).await?;
        response
            .bytes()
            .await
            .map_err(|err| RelayError::Transport(format!("Failed to read upstream body: {err}")))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    debug!(status = status.as_u16(), body_len = body.len(), "upstream returned an error");
    Err(RelayError::Upstream {
        status: status.as_u16(),
        message: sanitize_upstream_error(&body),
    })
}
