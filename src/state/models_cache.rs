use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::AppState;
use crate::routing::{parse_directory_listing, ModelDirectory};

/// Current model directory snapshot plus the TTL bookkeeping for refreshes.
pub(crate) struct DirectoryCache {
    seed: Arc<ModelDirectory>,
    current: RwLock<Arc<ModelDirectory>>,
    ttl_secs: u64,
    next_refresh_unix: AtomicU64,
    refreshing: AtomicBool,
}

impl DirectoryCache {
    #[must_use]
    pub(crate) fn new(seed: ModelDirectory, ttl_secs: u64) -> Self {
        let seed = Arc::new(seed);
        Self {
            current: RwLock::new(seed.clone()),
            seed,
            ttl_secs,
            next_refresh_unix: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> Arc<ModelDirectory> {
        self.current.read().clone()
    }

    #[must_use]
    pub(crate) fn seed(&self) -> &ModelDirectory {
        &self.seed
    }

    pub(crate) fn replace(&self, directory: ModelDirectory) {
        *self.current.write() = Arc::new(directory);
    }

    /// Claim the refresh slot when the TTL has elapsed and nobody else holds it.
    #[must_use]
    pub(crate) fn try_begin_refresh(&self, now: u64) -> Option<RefreshGuard<'_>> {
        if self.ttl_secs == 0 {
            return None;
        }

        let next = self.next_refresh_unix.load(Ordering::Relaxed);
        if now < next {
            return None;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return None;
        }

        self.next_refresh_unix
            .store(now.saturating_add(self.ttl_secs), Ordering::Relaxed);
        Some(RefreshGuard { cache: self })
    }
}

/// Held for the duration of one refresh; releases the slot when dropped.
pub(crate) struct RefreshGuard<'a> {
    cache: &'a DirectoryCache,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.cache.refreshing.store(false, Ordering::Release);
    }
}

/// Fetch the upstream listing and build a new snapshot over the static seed.
///
/// Returns `None` when refresh is disabled or the fetch fails; the caller
/// keeps the previous snapshot.
pub(crate) async fn fetch_directory(state: &AppState) -> Option<ModelDirectory> {
    let url = state.config.upstream.models_url()?;
    let body = match state
        .transport
        .get_json(&url, &state.config.upstream.api_key)
        .await
    {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, "model directory refresh failed; keeping previous snapshot");
            return None;
        }
    };
    let Some(entries) = parse_directory_listing(&body) else {
        warn!("model directory listing is not a JSON list; keeping previous snapshot");
        return None;
    };
    debug!(entries = entries.len(), "model directory refreshed");
    Some(state.directory_seed().merged_with(&entries))
}
