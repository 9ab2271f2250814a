//! Batched write-back of evicted login counters.
//!
//! The queue is unbounded so that handing a count over never waits on the
//! store. A single worker drains whatever is queued into one batch per store
//! round-trip. Shutdown closes the channel and flushes what was queued before
//! the close; the handle's `shutdown` returns only once that flush is done.

use super::LoginCount;
use crate::error::DiscoError;
use crate::metrics::SharedMetrics;
use crate::store::loginstats::{current_day, insert_counts};
use crate::store::Database;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Sending side of the write-back queue. Cheap to clone.
#[derive(Clone)]
pub struct WriteBackQueue {
    tx: mpsc::UnboundedSender<LoginCount>,
    metrics: SharedMetrics,
}

impl WriteBackQueue {
    /// Create a queue together with the receiving end a worker drains.
    pub fn channel(metrics: SharedMetrics) -> (Self, mpsc::UnboundedReceiver<LoginCount>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, metrics }, rx)
    }

    /// Hand a count over for persistence. Never blocks; once the worker has
    /// shut down the count is dropped.
    pub fn enqueue(&self, count: LoginCount) {
        if let Err(rejected) = self.tx.send(count) {
            debug!(key = %rejected.0.key, count = rejected.0.count, "Write-back queue closed, dropping count");
            self.metrics.writeback_dropped_total.inc();
        }
    }
}

pub struct WriteBackWorker {
    rx: mpsc::UnboundedReceiver<LoginCount>,
    db: Arc<Database>,
    metrics: SharedMetrics,
}

impl WriteBackWorker {
    /// Start the worker on `db`. The worker owns the connection and shuts it
    /// down when it exits.
    pub fn spawn(db: Arc<Database>, metrics: SharedMetrics) -> (WriteBackQueue, WriteBackHandle) {
        let (queue, rx) = WriteBackQueue::channel(Arc::clone(&metrics));
        (queue, Self::start(rx, db, metrics))
    }

    fn start(
        rx: mpsc::UnboundedReceiver<LoginCount>,
        db: Arc<Database>,
        metrics: SharedMetrics,
    ) -> WriteBackHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Self { rx, db, metrics };
        let join = tokio::spawn(worker.run(stop_rx));
        WriteBackHandle { stop: stop_tx, join }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!("Write-back worker started");

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                item = self.rx.recv() => match item {
                    Some(first) => {
                        let mut batch = vec![first];
                        while let Ok(next) = self.rx.try_recv() {
                            batch.push(next);
                        }
                        self.persist(batch).await;
                    }
                    None => break,
                },
            }
        }

        // No more input, but everything sent before the close still goes out.
        self.rx.close();
        let mut remaining = Vec::new();
        while let Some(count) = self.rx.recv().await {
            remaining.push(count);
        }
        if !remaining.is_empty() {
            info!(batch = remaining.len(), "Flushing queued login counts before exit");
            self.persist(remaining).await;
        }

        let db = Arc::clone(&self.db);
        if let Err(e) = tokio::task::spawn_blocking(move || db.shutdown()).await {
            error!(error = %e, "Failed to release write-back store connection");
        }
        info!("Write-back worker stopped");
    }

    async fn persist(&self, batch: Vec<LoginCount>) {
        let size = batch.len();
        let first = batch.first().map(|c| c.key.to_string());
        let db = Arc::clone(&self.db);

        let result = tokio::task::spawn_blocking(move || insert_counts(&db, &batch, current_day()))
            .await
            .map_err(DiscoError::from)
            .and_then(|inner| inner);

        match result {
            Ok(rows) => {
                debug!(batch = size, rows, "Persisted login counts");
                self.metrics.record_batch("persisted", size, rows);
            }
            Err(e) => {
                // already retried once by the store; the counts are stale by now
                error!(
                    error = %e,
                    batch = size,
                    first = first.as_deref().unwrap_or(""),
                    "Failed to persist login counts, discarding batch"
                );
                self.metrics.record_batch("failed", size, 0);
            }
        }
    }
}

pub struct WriteBackHandle {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl WriteBackHandle {
    /// Close the queue and wait until everything queued before the close has
    /// been persisted or logged as failed.
    pub async fn shutdown(self) -> Result<(), DiscoError> {
        let _ = self.stop.send(());
        self.join.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use crate::store::loginstats::ensure_schema;
    use crate::store::loginstats::tests::{count, row_count};
    use crate::store::tests::test_config;
    use std::time::{Duration, Instant};

    fn open_store(dir: &tempfile::TempDir) -> Arc<Database> {
        let db = Database::open(&test_config(dir), "writeback").unwrap();
        ensure_schema(&db).unwrap();
        Arc::new(db)
    }

    fn reopen(dir: &tempfile::TempDir) -> Database {
        Database::open(&test_config(dir), "verify").unwrap()
    }

    fn total_count(db: &Database) -> i64 {
        db.execute(|conn| {
            conn.query_row("SELECT COALESCE(SUM(count), 0) FROM loginstats", [], |row| row.get(0))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_counts_queued_before_shutdown_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, handle) = WriteBackWorker::spawn(open_store(&dir), create_metrics());

        for i in 0..100 {
            queue.enqueue(count(Some(1), &format!("idp-{}", i), 2));
        }
        handle.shutdown().await.unwrap();

        let db = reopen(&dir);
        assert_eq!(row_count(&db), 100);
        assert_eq!(total_count(&db), 200);
    }

    #[tokio::test]
    async fn test_queued_counts_are_drained_into_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = create_metrics();
        let (queue, rx) = WriteBackQueue::channel(Arc::clone(&metrics));
        for i in 0..100 {
            queue.enqueue(count(Some(1), &format!("idp-{}", i), 1));
        }

        let handle = WriteBackWorker::start(rx, open_store(&dir), Arc::clone(&metrics));
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.writeback_rows_total.get() < 100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await.unwrap();

        let batches = metrics
            .writeback_batches_total
            .with_label_values(&["persisted"])
            .get();
        assert_eq!(batches, 1);
        assert_eq!(row_count(&reopen(&dir)), 100);
    }

    #[tokio::test]
    async fn test_zero_counts_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, handle) = WriteBackWorker::spawn(open_store(&dir), create_metrics());

        queue.enqueue(count(Some(1), "idp-a", 0));
        queue.enqueue(count(Some(1), "idp-b", 1));
        queue.enqueue(count(None, "idp-c", 0));
        handle.shutdown().await.unwrap();

        let db = reopen(&dir);
        assert_eq!(row_count(&db), 1);
        let zero: i64 = db
            .execute(|conn| {
                conn.query_row("SELECT COUNT(*) FROM loginstats WHERE count <= 0", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(zero, 0);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_wait_for_an_unavailable_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_store(&dir);
        db.shutdown();
        let metrics = create_metrics();
        let (queue, handle) = WriteBackWorker::spawn(db, Arc::clone(&metrics));

        let started = Instant::now();
        for _ in 0..1000 {
            queue.enqueue(count(Some(1), "idp-a", 1));
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        handle.shutdown().await.unwrap();
        // every batch was logged as failed rather than silently lost
        let failed = metrics
            .writeback_batches_total
            .with_label_values(&["failed"])
            .get();
        assert!(failed >= 1);
        assert_eq!(metrics.writeback_rows_total.get(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = create_metrics();
        let (queue, handle) = WriteBackWorker::spawn(open_store(&dir), Arc::clone(&metrics));
        handle.shutdown().await.unwrap();

        queue.enqueue(count(Some(1), "idp-a", 5));
        assert_eq!(metrics.writeback_dropped_total.get(), 1);
    }
}
