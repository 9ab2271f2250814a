//! Entry points used by request handlers: recording logins and assembling
//! ranked IdP suggestions.

use crate::cache::{EntityListFetcher, EntitySet, FilterCache, RankingCache};
use crate::config::Config;
use crate::error::DiscoError;
use crate::logins::{Aggregator, CleanupScheduler, LoginKey, WriteBackHandle, WriteBackWorker};
use crate::metrics::SharedMetrics;
use crate::services::discofeed::DiscoFeedApi;
use crate::services::metadata::{IdpRecord, MetadataSource};
use crate::store::loginstats::ensure_schema;
use crate::store::Database;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct DiscoveryService<F = DiscoFeedApi> {
    aggregator: Arc<Aggregator>,
    rankings: RankingCache,
    filters: FilterCache<F>,
    metadata: Arc<dyn MetadataSource>,
    metrics: SharedMetrics,
}

/// Background tasks owned by a running [`DiscoveryService`].
pub struct Lifecycle {
    aggregator: Arc<Aggregator>,
    writeback: WriteBackHandle,
    cleanup: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    ranking_db: Arc<Database>,
    shutdown: watch::Sender<bool>,
}

impl<F: EntityListFetcher> DiscoveryService<F> {
    /// Open the store, create its schema and start the background tasks.
    ///
    /// The write-back worker, the cleanup scheduler and the ranking cache
    /// each get their own connection.
    pub fn start(
        config: &Config,
        metadata: Arc<dyn MetadataSource>,
        fetcher: F,
        metrics: SharedMetrics,
    ) -> Result<(Arc<Self>, Lifecycle), DiscoError> {
        if config.ranking.size == 0 {
            return Err(DiscoError::Config("ranking size must be positive".into()));
        }

        let open = |name: &'static str| -> Result<Arc<Database>, DiscoError> {
            let counter = metrics.store_retries_total.with_label_values(&[name]);
            Ok(Arc::new(Database::open(&config.database, name)?.with_retry_counter(counter)))
        };
        let writeback_db = open("writeback")?;
        ensure_schema(&writeback_db)?;
        let cleanup_db = open("cleanup")?;
        let ranking_db = open("ranking")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (queue, writeback) = WriteBackWorker::spawn(writeback_db, Arc::clone(&metrics));
        let aggregator = Arc::new(Aggregator::new(&config.aggregator, queue, Arc::clone(&metrics)));
        let sweeper = aggregator.spawn_sweeper(config.aggregator.sweep_interval, shutdown_rx.clone());
        let cleanup = CleanupScheduler::new(cleanup_db, config.cleanup.clone(), Arc::clone(&metrics))
            .spawn(shutdown_rx);

        let rankings = RankingCache::new(Arc::clone(&ranking_db), &config.ranking, Arc::clone(&metrics));
        let filters = FilterCache::new(
            fetcher,
            Arc::clone(&metadata),
            config.filter.clone(),
            Arc::clone(&metrics),
        );

        info!(
            database = %config.database.path.display(),
            ranking_size = config.ranking.size,
            max_counters = config.aggregator.max_entries,
            "Login statistics pipeline started"
        );

        let service = Arc::new(Self {
            aggregator: Arc::clone(&aggregator),
            rankings,
            filters,
            metadata,
            metrics,
        });
        let lifecycle = Lifecycle {
            aggregator,
            writeback,
            cleanup,
            sweeper,
            ranking_db,
            shutdown: shutdown_tx,
        };

        Ok((service, lifecycle))
    }

    /// Count a login to `entity_id` from `nethash`. Logins to IdPs that are
    /// not in the current metadata are ignored.
    pub fn record_login(&self, nethash: Option<u16>, entity_id: &str) {
        if !self.metadata.is_known_entity(entity_id) {
            debug!(entity_id, "Ignoring login to unknown IdP");
            self.metrics.logins_total.with_label_values(&["ignored"]).inc();
            return;
        }

        self.aggregator.increment(LoginKey::new(nethash, entity_id));
        self.metrics.logins_total.with_label_values(&["recorded"]).inc();
    }

    /// Most chosen IdPs for `nethash`, at most `limit`. Empty when no ranking
    /// is available.
    pub async fn ranked_idps(&self, nethash: Option<u16>, limit: usize) -> Vec<String> {
        self.rankings
            .ranked(nethash, limit)
            .await
            .unwrap_or_default()
    }

    pub async fn global_ranked_idps(&self, limit: usize) -> Vec<String> {
        self.ranked_idps(None, limit).await
    }

    /// IdPs accepted by the application publishing `filter_url`. `None`
    /// when no filter is configured, the URL is not an allowed list source,
    /// or no list could be loaded.
    pub async fn accepted_idps(&self, filter_url: Option<&str>) -> Option<EntitySet> {
        match filter_url {
            Some(url) if !url.is_empty() => self.filters.get(url).await,
            _ => None,
        }
    }

    /// IdPs to offer first: the requester's previous choice, then the
    /// favourites of their network, then global favourites if still short.
    ///
    /// Falls back to the full list of known IdPs when nothing ranked is left.
    pub async fn suggested_idps(
        &self,
        favourite: Option<&str>,
        nethash: Option<u16>,
        filter_url: Option<&str>,
        limit: usize,
    ) -> Vec<IdpRecord> {
        let accepted = self.accepted_idps(filter_url).await;
        let is_accepted = |id: &str| accepted.as_ref().map_or(true, |set| set.contains(id));

        let mut seen = HashSet::new();
        let mut candidates: Vec<String> = Vec::with_capacity(limit);
        let mut push = |id: &str, candidates: &mut Vec<String>| {
            if is_accepted(id) && seen.insert(id.to_string()) {
                candidates.push(id.to_string());
            }
        };

        if let Some(favourite) = favourite.filter(|f| self.metadata.is_known_entity(f)) {
            push(favourite, &mut candidates);
        }
        if let Some(network) = nethash {
            if let Some(ranking) = self.rankings.top_n(Some(network)).await {
                for id in ranking.iter() {
                    push(id.as_str(), &mut candidates);
                }
            }
        }
        if candidates.len() < limit {
            if let Some(ranking) = self.rankings.global_top_n().await {
                for id in ranking.iter() {
                    push(id.as_str(), &mut candidates);
                }
            }
        }

        let mut suggestions = self.metadata.resolve_entities(&candidates);
        if suggestions.is_empty() {
            debug!(nethash = ?nethash, "No ranked IdPs, suggesting the full list");
            let all: Vec<String> = self
                .metadata
                .all_entities()
                .into_iter()
                .filter(|id| is_accepted(id.as_str()))
                .collect();
            suggestions = self.metadata.resolve_entities(&all);
        }

        suggestions.truncate(limit);
        suggestions
    }

    /// Number of IdPs kept per ranking
    pub fn ranking_size(&self) -> usize {
        self.rankings.size()
    }
}

impl Lifecycle {
    /// Hand every live counter to the write-back worker, stop the periodic
    /// tasks and wait until the worker has flushed and exited.
    pub async fn shutdown(self) -> Result<(), DiscoError> {
        info!("Shutting down login statistics pipeline");

        self.aggregator.flush_all();
        let _ = self.shutdown.send(true);

        self.writeback.shutdown().await?;
        for (name, task) in [("sweeper", self.sweeper), ("cleanup", self.cleanup)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        let ranking_db = self.ranking_db;
        tokio::task::spawn_blocking(move || ranking_db.shutdown()).await?;

        info!("Login statistics pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use crate::services::metadata::MetadataStore;
    use crate::store::tests::test_config;
    use std::time::Duration;

    struct StaticList(Vec<String>);

    impl EntityListFetcher for StaticList {
        async fn fetch_entity_list(&self, _url: &str) -> Result<Vec<String>, DiscoError> {
            Ok(self.0.clone())
        }
    }

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.database = test_config(dir);
        config.ranking.size = 5;
        config.filter.allowed_prefixes = vec!["https://sp.example/".to_string()];
        config
    }

    fn metadata() -> Arc<dyn MetadataSource> {
        Arc::new(MetadataStore::from_records(
            ["idp-a", "idp-b", "idp-c", "idp-d"]
                .iter()
                .map(|id| IdpRecord::new(*id, None))
                .collect(),
        ))
    }

    fn start(config: &Config, filter: &[&str]) -> (Arc<DiscoveryService<StaticList>>, Lifecycle) {
        let fetcher = StaticList(filter.iter().map(|s| s.to_string()).collect());
        DiscoveryService::start(config, metadata(), fetcher, create_metrics()).unwrap()
    }

    #[tokio::test]
    async fn test_flushed_logins_are_ranked() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let (service, lifecycle) = start(&config, &[]);
        for _ in 0..3 {
            service.record_login(Some(42), "idp-a");
        }
        service.record_login(Some(42), "idp-b");
        lifecycle.shutdown().await.unwrap();

        let (service, lifecycle) = start(&config, &[]);
        assert_eq!(service.ranked_idps(Some(42), 5).await, vec!["idp-a", "idp-b"]);
        lifecycle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let (service, lifecycle) = start(&config, &[]);
        service.record_login(Some(1), "idp-c");
        service.record_login(Some(2), "idp-c");
        service.record_login(Some(2), "idp-d");
        service.record_login(None, "idp-d");
        service.record_login(None, "idp-d");
        lifecycle.shutdown().await.unwrap();

        let (service, lifecycle) = start(&config, &[]);
        assert!(service.ranked_idps(Some(7), 5).await.is_empty());
        assert_eq!(service.global_ranked_idps(5).await, vec!["idp-d", "idp-c"]);
        assert_eq!(service.global_ranked_idps(1).await, vec!["idp-d"]);
        lifecycle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_idps_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let (service, lifecycle) = start(&config, &[]);
        service.record_login(Some(42), "https://evil.example/idp");
        lifecycle.shutdown().await.unwrap();

        let (service, lifecycle) = start(&config, &[]);
        assert!(service.global_ranked_idps(5).await.is_empty());
        lifecycle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_suggestions_order_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let (service, lifecycle) = start(&config, &[]);
        service.record_login(Some(42), "idp-b");
        for _ in 0..5 {
            service.record_login(Some(9), "idp-c");
        }
        lifecycle.shutdown().await.unwrap();

        let (service, lifecycle) = start(&config, &["idp-a", "idp-b", "idp-d"]);

        let ids = |records: Vec<IdpRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.entity_id).collect()
        };

        // favourite, then network, then global
        let suggested = service.suggested_idps(Some("idp-a"), Some(42), None, 5).await;
        assert_eq!(ids(suggested), vec!["idp-a", "idp-b", "idp-c"]);

        // unknown favourites are skipped, results are truncated
        let suggested = service
            .suggested_idps(Some("idp-unknown"), Some(42), None, 1)
            .await;
        assert_eq!(ids(suggested), vec!["idp-b"]);

        // the filter removes idp-c
        let suggested = service
            .suggested_idps(None, Some(42), Some("https://sp.example/filter"), 5)
            .await;
        assert_eq!(ids(suggested), vec!["idp-b"]);

        // lists outside the allowed sources leave suggestions unfiltered
        let suggested = service
            .suggested_idps(None, Some(42), Some("http://169.254.169.254/filter"), 5)
            .await;
        assert_eq!(ids(suggested), vec!["idp-b", "idp-c"]);

        lifecycle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_suggestions_fall_back_to_full_list() {
        let dir = tempfile::tempdir().unwrap();
        let (service, lifecycle) = start(&config(&dir), &[]);

        let suggested = service.suggested_idps(None, Some(3), None, 3).await;
        let ids: Vec<String> = suggested.into_iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec!["idp-a", "idp-b", "idp-c"]);

        tokio::time::timeout(Duration::from_secs(5), lifecycle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
