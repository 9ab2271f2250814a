//! Accepted-IdP lists fetched from application-supplied URLs.
//!
//! A stale list is refreshed by a background task, at most one per URL.
//! Readers wait a short while for that task and then answer with whatever
//! is cached, so a slow or dead list source costs a bounded delay.
//!
//! Only URLs under a configured prefix are ever fetched, and the number of
//! lists kept is bounded.

use crate::config::FilterConfig;
use crate::error::DiscoError;
use crate::metrics::SharedMetrics;
use crate::services::metadata::MetadataSource;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::sync::Cache;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Source of remote entity ID lists.
pub trait EntityListFetcher: Send + Sync + 'static {
    fn fetch_entity_list(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Vec<String>, DiscoError>> + Send;
}

pub type EntitySet = Arc<HashSet<String>>;

type RefreshFuture = Shared<BoxFuture<'static, ()>>;

#[derive(Clone, Default)]
struct FilterEntry {
    value: Option<EntitySet>,
    last_reload: Option<Instant>,
}

struct Inner<F> {
    store: Cache<String, FilterEntry>,
    inflight: DashMap<String, RefreshFuture>,
    fetcher: F,
    metadata: Arc<dyn MetadataSource>,
    config: FilterConfig,
    metrics: SharedMetrics,
}

pub struct FilterCache<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for FilterCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: EntityListFetcher> FilterCache<F> {
    pub fn new(
        fetcher: F,
        metadata: Arc<dyn MetadataSource>,
        config: FilterConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let store = Cache::builder().max_capacity(config.max_lists).build();
        Self {
            inner: Arc::new(Inner {
                store,
                inflight: DashMap::new(),
                fetcher,
                metadata,
                config,
                metrics,
            }),
        }
    }

    /// Best known list of accepted IdPs for `url`, possibly stale. `None`
    /// when no list was ever loaded for it or `url` is not an allowed list
    /// source.
    pub async fn get(&self, url: &str) -> Option<EntitySet> {
        if !self.inner.is_allowed(url) {
            debug!(url, "Ignoring filter list outside the allowed sources");
            self.inner
                .metrics
                .filter_refreshes_total
                .with_label_values(&["rejected"])
                .inc();
            return None;
        }

        let entry = self.inner.entry(url);
        if !self.inner.is_stale(&entry) {
            return entry.value;
        }

        let refresh = match self.inner.inflight.entry(url.to_string()) {
            Entry::Occupied(running) => running.get().clone(),
            Entry::Vacant(slot) => {
                // a refresh may have been published since the first read
                let entry = self.inner.entry(url);
                if !self.inner.is_stale(&entry) {
                    return entry.value;
                }
                slot.insert(self.spawn_refresh(url.to_string())).clone()
            }
        };

        // returning nothing is worse than a few seconds of latency
        let wait = if entry.value.is_some() {
            self.inner.config.stale_wait
        } else {
            self.inner.config.cold_wait
        };
        if tokio::time::timeout(wait, refresh).await.is_err() {
            debug!(url, wait_ms = wait.as_millis() as u64, "Filter refresh still running, serving cached list");
            self.inner.metrics.filter_stale_served_total.inc();
        }

        self.inner.entry(url).value
    }

    fn spawn_refresh(&self, url: String) -> RefreshFuture {
        let inner = Arc::clone(&self.inner);
        // The task clears its in-flight slot itself: readers that time out
        // stop polling the shared future.
        let task = tokio::spawn(async move {
            if AssertUnwindSafe(inner.refresh(&url)).catch_unwind().await.is_err() {
                error!(url = %url, "Filter refresh panicked");
                inner
                    .metrics
                    .filter_refreshes_total
                    .with_label_values(&["failed"])
                    .inc();
            }
            inner.inflight.remove(&url);
        });
        async move {
            if let Err(e) = task.await {
                error!(error = %e, "Filter refresh task did not complete");
            }
        }
        .boxed()
        .shared()
    }
}

impl<F: EntityListFetcher> Inner<F> {
    fn is_allowed(&self, url: &str) -> bool {
        self.config
            .allowed_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    fn entry(&self, url: &str) -> FilterEntry {
        self.store.get(url).unwrap_or_default()
    }

    fn is_stale(&self, entry: &FilterEntry) -> bool {
        entry
            .last_reload
            .map_or(true, |at| at.elapsed() > self.config.ttl)
    }

    async fn refresh(&self, url: &str) {
        debug!(url, "Refreshing filter list");

        match self.fetcher.fetch_entity_list(url).await {
            Ok(ids) => {
                let accepted: HashSet<String> = self
                    .metadata
                    .resolve_entities(&ids)
                    .into_iter()
                    .map(|record| record.entity_id)
                    .collect();
                debug!(url, listed = ids.len(), accepted = accepted.len(), "Filter list refreshed");

                self.store.insert(
                    url.to_string(),
                    FilterEntry {
                        value: Some(Arc::new(accepted)),
                        last_reload: Some(Instant::now()),
                    },
                );
                self.metrics
                    .filter_refreshes_total
                    .with_label_values(&["ok"])
                    .inc();
            }
            Err(e) => {
                // the previous list and its timestamp stay in place
                info!(url, error = %e, "Failed to update filter");
                self.metrics
                    .filter_refreshes_total
                    .with_label_values(&["failed"])
                    .inc();
            }
        }
    }
}
