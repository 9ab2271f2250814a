//! Known identity providers, as published by the discovery feed.

use crate::config::MetadataConfig;
use crate::metrics::SharedMetrics;
use crate::services::discofeed::DiscoFeedApi;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdpRecord {
    #[serde(rename = "entityID")]
    pub entity_id: String,
    pub display_name: Option<String>,
}

impl IdpRecord {
    pub fn new(entity_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            display_name,
        }
    }

    fn sort_name(&self) -> String {
        self.display_name
            .as_deref()
            .unwrap_or(&self.entity_id)
            .to_lowercase()
    }
}

/// What the login pipeline needs to know about IdPs.
pub trait MetadataSource: Send + Sync {
    fn is_known_entity(&self, entity_id: &str) -> bool;

    /// Records for `entity_ids`, in the given order. Unknown IDs are skipped.
    fn resolve_entities(&self, entity_ids: &[String]) -> Vec<IdpRecord>;

    /// Every known entity ID, ordered by display name.
    fn all_entities(&self) -> Vec<String>;
}

#[derive(Default)]
struct Snapshot {
    by_id: HashMap<String, IdpRecord>,
    sorted: Vec<String>,
}

/// In-memory IdP metadata, replaced as a whole on every feed refresh so
/// readers always see one consistent feed.
#[derive(Default)]
pub struct MetadataStore {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn from_records(records: Vec<IdpRecord>) -> Self {
        let store = Self::new();
        store.replace(records);
        store
    }

    /// Publish a new feed. Duplicate entity IDs keep their first record.
    pub fn replace(&self, records: Vec<IdpRecord>) -> usize {
        let mut by_id = HashMap::with_capacity(records.len());
        for record in records {
            by_id.entry(record.entity_id.clone()).or_insert(record);
        }

        let mut sorted: Vec<&IdpRecord> = by_id.values().collect();
        sorted.sort_by_cached_key(|r| (r.sort_name(), r.entity_id.clone()));
        let sorted = sorted.into_iter().map(|r| r.entity_id.clone()).collect();

        let snapshot = Arc::new(Snapshot { by_id, sorted });
        let len = snapshot.by_id.len();
        *self.snapshot.write() = snapshot;
        len
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Download the feed once and publish it. The previous feed stays in
    /// place when the download fails.
    pub async fn refresh_from(&self, api: &DiscoFeedApi, url: &str, metrics: &SharedMetrics) -> bool {
        match api.fetch_feed(url).await {
            Ok(records) => {
                let count = self.replace(records);
                metrics.metadata_idps.set(count as f64);
                metrics.metadata_refreshes_total.with_label_values(&["ok"]).inc();
                info!(idps = count, "Discovery feed refreshed");
                true
            }
            Err(e) => {
                metrics.metadata_refreshes_total.with_label_values(&["failed"]).inc();
                error!(error = %e, url, idps = self.len(), "Failed to fetch discovery feed, keeping existing data");
                false
            }
        }
    }

    /// Refresh from `config.feed_url` until shutdown. Failed downloads are
    /// retried after the shorter retry interval.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        api: DiscoFeedApi,
        config: MetadataConfig,
        metrics: SharedMetrics,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let url = config.feed_url.clone()?;
        let store = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!(url = %url, "Starting discovery feed refresher");
            loop {
                let ok = store.refresh_from(&api, &url, &metrics).await;
                let wait: Duration = if ok {
                    config.refresh_interval
                } else {
                    config.retry_interval
                };
                debug!(wait_secs = wait.as_secs(), "Next discovery feed refresh scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Discovery feed refresher stopped");
        }))
    }
}

impl MetadataSource for MetadataStore {
    fn is_known_entity(&self, entity_id: &str) -> bool {
        self.snapshot.read().by_id.contains_key(entity_id)
    }

    fn resolve_entities(&self, entity_ids: &[String]) -> Vec<IdpRecord> {
        let snapshot = self.current();
        entity_ids
            .iter()
            .filter_map(|id| {
                let record = snapshot.by_id.get(id);
                if record.is_none() {
                    debug!(entity_id = %id, "No metadata for entity");
                }
                record.cloned()
            })
            .collect()
    }

    fn all_entities(&self) -> Vec<String> {
        self.current().sorted.clone()
    }
}
