//! In-memory login counters keyed by (network, IdP).
//!
//! Counters live in a bounded moka cache. Expiry and capacity evictions are
//! turned into [`LoginCount`] messages on the write-back queue, so the cache
//! itself never touches the store.

use super::{LoginCount, LoginKey, WriteBackQueue};
use crate::config::AggregatorConfig;
use crate::metrics::SharedMetrics;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// A running login count. Increments from concurrent requests are not
/// coordinated beyond the atomic add; a count is a statistic, not a ledger.
#[derive(Debug, Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the count and reset it to zero.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

pub struct Aggregator {
    counters: Cache<LoginKey, Arc<Counter>>,
    queue: WriteBackQueue,
    metrics: SharedMetrics,
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig, queue: WriteBackQueue, metrics: SharedMetrics) -> Self {
        let listener_queue = queue.clone();
        let listener_metrics = Arc::clone(&metrics);

        let counters = Cache::builder()
            .max_capacity(config.max_entries)
            // measured from creation: increments mutate the counter, not the entry
            .time_to_live(config.window)
            .eviction_listener(move |key: Arc<LoginKey>, counter: Arc<Counter>, cause| {
                let label = match cause {
                    RemovalCause::Expired => "expired",
                    // an expired counter superseded by a fresh one on the same key
                    RemovalCause::Replaced => "replaced",
                    RemovalCause::Size => "size",
                    // explicit removals are handed over by flush_all itself
                    RemovalCause::Explicit => return,
                };
                listener_metrics
                    .aggregator_evictions_total
                    .with_label_values(&[label])
                    .inc();
                listener_queue.enqueue(LoginCount {
                    key: (*key).clone(),
                    count: counter.take(),
                });
            })
            .build();

        Self {
            counters,
            queue,
            metrics,
        }
    }

    /// Count one login. Never waits on I/O.
    pub fn increment(&self, key: LoginKey) {
        self.counters
            .get_with(key, || Arc::new(Counter::default()))
            .increment();
    }

    /// Run pending expirations and evictions now instead of on the next write.
    pub fn sweep(&self) {
        self.counters.run_pending_tasks();
        self.metrics
            .aggregator_entries
            .set(self.counters.entry_count() as f64);
    }

    /// Hand every live counter to the write-back queue.
    pub fn flush_all(&self) {
        self.counters.run_pending_tasks();

        let keys: Vec<Arc<LoginKey>> = self.counters.iter().map(|(key, _)| key).collect();
        let mut flushed = 0usize;
        for key in keys {
            if let Some(counter) = self.counters.remove(key.as_ref()) {
                self.queue.enqueue(LoginCount {
                    key: (*key).clone(),
                    count: counter.take(),
                });
                flushed += 1;
            }
        }

        self.counters.run_pending_tasks();
        self.metrics
            .aggregator_evictions_total
            .with_label_values(&["flushed"])
            .inc_by(flushed as u64);
        info!(counters = flushed, "Flushed login counters");
    }

    pub fn entry_count(&self) -> u64 {
        self.counters.entry_count()
    }

    /// Periodically sweep so that counters expire during idle periods too.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        aggregator.sweep();
                        debug!(entries = aggregator.entry_count(), "Swept login counters");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Counter sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use std::collections::HashMap;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn aggregator(window: Duration, max_entries: u64) -> (Aggregator, UnboundedReceiver<LoginCount>) {
        let metrics = create_metrics();
        let (queue, rx) = WriteBackQueue::channel(Arc::clone(&metrics));
        let config = AggregatorConfig {
            window,
            max_entries,
            sweep_interval: Duration::from_secs(1800),
        };
        (Aggregator::new(&config, queue, metrics), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<LoginCount>) -> HashMap<LoginKey, u32> {
        let mut totals = HashMap::new();
        while let Ok(c) = rx.try_recv() {
            *totals.entry(c.key).or_insert(0) += c.count;
        }
        totals
    }

    #[test]
    fn test_counter_take_resets() {
        let counter = Counter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.take(), 2);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn test_flush_hands_over_every_increment() {
        let (agg, mut rx) = aggregator(Duration::from_secs(600), 1000);

        for _ in 0..3 {
            agg.increment(LoginKey::new(Some(42), "idp-a"));
        }
        agg.increment(LoginKey::new(Some(42), "idp-b"));
        agg.increment(LoginKey::new(None, "idp-a"));
        agg.flush_all();

        let totals = drain(&mut rx);
        assert_eq!(totals.len(), 3);
        assert_eq!(totals[&LoginKey::new(Some(42), "idp-a")], 3);
        assert_eq!(totals[&LoginKey::new(Some(42), "idp-b")], 1);
        assert_eq!(totals[&LoginKey::new(None, "idp-a")], 1);

        // nothing is handed over twice
        agg.flush_all();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_expired_counters_are_handed_over_on_sweep() {
        let (agg, mut rx) = aggregator(Duration::from_millis(50), 1000);

        for _ in 0..4 {
            agg.increment(LoginKey::new(Some(7), "idp-a"));
        }
        std::thread::sleep(Duration::from_millis(150));
        agg.sweep();

        let totals = drain(&mut rx);
        assert_eq!(totals[&LoginKey::new(Some(7), "idp-a")], 4);
        assert_eq!(agg.entry_count(), 0);
    }

    #[test]
    fn test_capacity_evictions_keep_their_counts() {
        let (agg, mut rx) = aggregator(Duration::from_secs(600), 10);

        for i in 0..50 {
            agg.increment(LoginKey::new(Some(1), format!("idp-{}", i)));
        }
        agg.sweep();
        assert!(agg.entry_count() <= 10);

        agg.flush_all();
        let total: u32 = drain(&mut rx).values().sum();
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (agg, _rx) = aggregator(Duration::from_secs(600), 10);
        let (tx, rx) = watch::channel(false);

        let handle = Arc::new(agg).spawn_sweeper(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_alone_hands_over_idle_counters() {
        let (agg, mut rx) = aggregator(Duration::from_millis(50), 1000);
        let agg = Arc::new(agg);
        let (tx, shutdown) = watch::channel(false);
        let handle = agg.spawn_sweeper(Duration::from_millis(20), shutdown);

        agg.increment(LoginKey::new(Some(3), "idp-a"));
        agg.increment(LoginKey::new(Some(3), "idp-a"));

        // no further access to the aggregator: only the timer can expire it
        let handed_over = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handed_over.key, LoginKey::new(Some(3), "idp-a"));
        assert_eq!(handed_over.count, 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
