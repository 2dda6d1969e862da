mod models_cache;
mod request_id;

use std::sync::Arc;

use crate::auth::{authenticate, build_allowed_key_set, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::routing::ModelDirectory;
use crate::transport::HttpTransport;
use crate::util::unix_now_secs;

use models_cache::{fetch_directory, DirectoryCache};
use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    directory: DirectoryCache,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        let directory = DirectoryCache::new(
            ModelDirectory::from_config(&config),
            config.server.models_cache_ttl_secs,
        );
        let allowed_client_keys = build_allowed_key_set(&config);
        Self {
            config,
            transport,
            directory,
            allowed_client_keys,
            request_ids: RequestIdGenerator::new(),
        }
    }

    /// Build state with a transport configured from `config.server`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the HTTP client cannot be built.
    pub fn from_config(config: AppConfig) -> Result<Self, RelayError> {
        let transport = HttpTransport::new(&config.server)?;
        Ok(Self::new(config, transport))
    }

    pub fn next_request_seq(&self) -> u64 {
        self.request_ids.next_seq()
    }

    #[must_use]
    pub fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        self.request_ids.request_uuid(request_seq)
    }

    /// Authenticate a request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Auth` when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), RelayError> {
        authenticate(headers, &self.allowed_client_keys)
    }

    /// The model directory as of now. Hold on to it for the whole request.
    #[must_use]
    pub fn directory(&self) -> Arc<ModelDirectory> {
        self.directory.snapshot()
    }

    pub(crate) fn directory_seed(&self) -> &ModelDirectory {
        self.directory.seed()
    }

    /// Refetch the upstream listing if the TTL has elapsed. At most one
    /// refresh runs at a time; failures keep the previous snapshot.
    pub async fn maybe_refresh_directory(&self) {
        if self.config.upstream.models_url().is_none() {
            return;
        }
        let Some(_refresh) = self.directory.try_begin_refresh(unix_now_secs()) else {
            return;
        };
        if let Some(directory) = fetch_directory(self).await {
            self.directory.replace(directory);
        }
    }
}
