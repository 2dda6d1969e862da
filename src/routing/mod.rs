pub mod dispatch;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{AppConfig, ModelEntryConfig};

const MODEL_CREATED_EPOCH: u64 = 1_677_610_602;

/// Where a requested model identifier goes upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub provider: Arc<str>,
    /// Provider-internal model name.
    pub name: Arc<str>,
}

/// Immutable snapshot of the model directory.
///
/// Requests take an `Arc` to the current snapshot when they start and use it
/// for the whole request; a refresh builds a new snapshot instead of mutating.
#[derive(Debug, Clone, Default)]
pub struct ModelDirectory {
    routes: BTreeMap<String, ModelRoute>,
}

impl ModelDirectory {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_entries(&config.models)
    }

    #[must_use]
    pub fn from_entries(entries: &[ModelEntryConfig]) -> Self {
        let mut directory = Self::default();
        directory.insert_entries(entries);
        directory
    }

    /// Copy of this snapshot with `entries` laid over it; later entries win.
    #[must_use]
    pub fn merged_with(&self, entries: &[ModelEntryConfig]) -> Self {
        let mut directory = self.clone();
        directory.insert_entries(entries);
        directory
    }

    fn insert_entries(&mut self, entries: &[ModelEntryConfig]) {
        for entry in entries {
            self.routes.insert(
                entry.id.clone(),
                ModelRoute {
                    provider: Arc::from(entry.provider.as_str()),
                    name: Arc::from(entry.name.as_str()),
                },
            );
        }
    }

    #[must_use]
    pub fn resolve(&self, model: &str) -> Option<&ModelRoute> {
        self.routes.get(model)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// OpenAI-style `/v1/models` listing, sorted by id.
    #[must_use]
    pub fn models_response_body(&self) -> Bytes {
        let models: Vec<Value> = self
            .routes
            .iter()
            .map(|(id, route)| {
                serde_json::json!({
                    "id": id.as_str(),
                    "object": "model",
                    "created": MODEL_CREATED_EPOCH,
                    "owned_by": route.provider.as_ref(),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "object": "list",
            "data": models,
        });
        serde_json::to_vec(&payload).map_or_else(
            |_| Bytes::from_static(br#"{"object":"list","data":[]}"#),
            Bytes::from,
        )
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryListing {
    #[serde(default)]
    data: Vec<Value>,
}

/// Parse an upstream `{ "data": [ { id, provider, name } ] }` listing.
///
/// Entries missing any of the three fields are skipped. Returns `None` when
/// the body is not a listing at all.
#[must_use]
pub fn parse_directory_listing(body: &[u8]) -> Option<Vec<ModelEntryConfig>> {
    let listing: DirectoryListing = serde_json::from_slice(body).ok()?;
    let entries = listing
        .data
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<ModelEntryConfig>(entry).ok())
        .filter(|entry| {
            !entry.id.is_empty() && !entry.provider.is_empty() && !entry.name.is_empty()
        })
        .collect();
    Some(entries)
}
