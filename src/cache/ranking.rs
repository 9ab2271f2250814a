//! Most chosen IdPs per network, and globally.
//!
//! Rankings are rebuilt from the store on a miss and kept for a fixed TTL,
//! regardless of how many logins arrive in between.

use crate::config::RankingConfig;
use crate::error::DiscoError;
use crate::metrics::SharedMetrics;
use crate::store::loginstats::top_entities;
use crate::store::Database;
use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, error};

/// One entry per 16-bit network hash plus the global ranking.
const MAX_RANKINGS: u64 = u16::MAX as u64 + 2;

pub type Ranking = Arc<Vec<String>>;

pub struct RankingCache {
    /// `None` is the global ranking
    rankings: Cache<Option<u16>, Ranking>,
    /// Both ranking queries share this connection
    db: Arc<Database>,
    size: usize,
    metrics: SharedMetrics,
}

impl RankingCache {
    pub fn new(db: Arc<Database>, config: &RankingConfig, metrics: SharedMetrics) -> Self {
        let rankings = Cache::builder()
            .max_capacity(MAX_RANKINGS)
            .time_to_live(config.ttl)
            .build();

        Self {
            rankings,
            db,
            size: config.size,
            metrics,
        }
    }

    /// Maximum number of entity IDs in a ranking
    pub fn size(&self) -> usize {
        self.size
    }

    /// Up to `size` entity IDs most chosen from `nethash`, best first. An
    /// undefined network gets the global ranking. `None` means no ranking
    /// could be loaded and the caller should fall back to another source.
    pub async fn top_n(&self, nethash: Option<u16>) -> Option<Ranking> {
        let scope = if nethash.is_some() { "network" } else { "global" };

        let entry = self
            .rankings
            .entry(nethash)
            .or_try_insert_with(load(Arc::clone(&self.db), nethash, self.size))
            .await;

        match entry {
            Ok(entry) => {
                let outcome = if entry.is_fresh() { "miss" } else { "hit" };
                self.metrics
                    .ranking_lookups_total
                    .with_label_values(&[scope, outcome])
                    .inc();
                Some(entry.into_value())
            }
            Err(e) => {
                error!(error = %e, nethash = ?nethash, "Failed to load IdP ranking");
                self.metrics
                    .ranking_lookups_total
                    .with_label_values(&[scope, "failed"])
                    .inc();
                None
            }
        }
    }

    pub async fn global_top_n(&self) -> Option<Ranking> {
        self.top_n(None).await
    }

    /// Like [`top_n`](Self::top_n), truncated to `limit`.
    pub async fn ranked(&self, nethash: Option<u16>, limit: usize) -> Option<Vec<String>> {
        self.top_n(nethash)
            .await
            .map(|ranking| ranking.iter().take(limit).cloned().collect())
    }
}

async fn load(db: Arc<Database>, nethash: Option<u16>, size: usize) -> Result<Ranking, DiscoError> {
    let ranking = tokio::task::spawn_blocking(move || top_entities(&db, nethash, size)).await??;
    debug!(nethash = ?nethash, entries = ranking.len(), "Loaded IdP ranking");
    Ok(Arc::new(ranking))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use crate::store::loginstats::tests::count;
    use crate::store::loginstats::{current_day, ensure_schema, insert_counts};
    use crate::store::tests::test_config;
    use std::time::Duration;

    fn setup(dir: &tempfile::TempDir, ttl: Duration) -> (RankingCache, Arc<Database>) {
        let db = Database::open(&test_config(dir), "ranking").unwrap();
        ensure_schema(&db).unwrap();
        let db = Arc::new(db);
        let config = RankingConfig { size: 3, ttl };
        (RankingCache::new(Arc::clone(&db), &config, create_metrics()), db)
    }

    fn seed(db: &Database) {
        insert_counts(
            db,
            &[
                count(Some(42), "idp-a", 5),
                count(Some(42), "idp-b", 9),
                count(Some(42), "idp-c", 1),
                count(Some(42), "idp-d", 3),
                count(Some(7), "idp-e", 100),
            ],
            current_day(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_ranking_is_bounded_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, db) = setup(&dir, Duration::from_secs(3600));
        seed(&db);

        let ranking = cache.top_n(Some(42)).await.unwrap();
        assert_eq!(*ranking, vec!["idp-b", "idp-a", "idp-d"]);

        let global = cache.global_top_n().await.unwrap();
        assert_eq!(global[0], "idp-e");
        assert_eq!(global.len(), 3);

        assert_eq!(cache.ranked(Some(42), 2).await.unwrap(), vec!["idp-b", "idp-a"]);
    }

    #[tokio::test]
    async fn test_ranking_is_cached_until_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, db) = setup(&dir, Duration::from_millis(200));
        seed(&db);
        assert_eq!(cache.top_n(Some(42)).await.unwrap()[0], "idp-b");

        insert_counts(&db, &[count(Some(42), "idp-c", 50)], current_day()).unwrap();
        assert_eq!(cache.top_n(Some(42)).await.unwrap()[0], "idp-b");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.top_n(Some(42)).await.unwrap()[0], "idp-c");
    }

    #[tokio::test]
    async fn test_unknown_network_has_empty_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, db) = setup(&dir, Duration::from_secs(3600));
        seed(&db);

        assert!(cache.top_n(Some(1234)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_yields_no_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, db) = setup(&dir, Duration::from_secs(3600));
        db.shutdown();

        assert!(cache.top_n(Some(42)).await.is_none());
        assert!(cache.ranked(None, 5).await.is_none());
    }
}
