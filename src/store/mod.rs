//! Retry-tolerant access to the login statistics store.
//!
//! A [`Database`] owns one SQLite connection behind a mutex. The mutex
//! protects the connection itself, so logically distinct statements that
//! share a `Database` are serialized. Every operation is retried exactly
//! once after the connection has been closed and reopened; a second failure
//! is returned to the caller, who decides whether to give up for this cycle.

pub mod loginstats;

use crate::config::DatabaseConfig;
use crate::error::DiscoError;
use parking_lot::Mutex;
use prometheus::IntCounter;
use rusqlite::{CachedStatement, Connection, Params};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Database {
    /// Label for log lines, one per logical user of a connection
    name: &'static str,
    path: PathBuf,
    busy_timeout: Duration,
    conn: Mutex<Option<Connection>>,
    shut_down: AtomicBool,
    retries: AtomicU64,
    retry_counter: Option<IntCounter>,
}

impl Database {
    /// Open the store eagerly so that a wrong path or unusable file is
    /// reported at startup instead of on first use.
    pub fn open(config: &DatabaseConfig, name: &'static str) -> Result<Self, DiscoError> {
        let db = Self {
            name,
            path: config.path.clone(),
            busy_timeout: config.busy_timeout,
            conn: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            retries: AtomicU64::new(0),
            retry_counter: None,
        };

        let conn = db.connect()?;
        *db.conn.lock() = Some(conn);
        Ok(db)
    }

    /// Also count reconnect-and-retry cycles in `counter`.
    pub fn with_retry_counter(mut self, counter: IntCounter) -> Self {
        self.retry_counter = Some(counter);
        self
    }

    fn connect(&self) -> Result<Connection, DiscoError> {
        info!(db = self.name, path = %self.path.display(), "Connecting to login statistics store");

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        // readers on other connections must not block the write-back batches
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(db = self.name, journal_mode = %mode, "Store connection ready");

        Ok(conn)
    }

    /// Run `op` against the connection, retrying once on a fresh connection.
    ///
    /// `op` must not have side effects outside the store, since it may run
    /// twice. It does not need to handle errors itself; any error causes the
    /// connection (and its prepared statement cache) to be dropped.
    pub fn execute<T, F>(&self, mut op: F) -> Result<T, DiscoError>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut slot = self.conn.lock();

        match self.try_execute(&mut slot, &mut op) {
            Ok(value) => return Ok(value),
            Err(DiscoError::ShutDown) => return Err(DiscoError::ShutDown),
            Err(e) => {
                warn!(db = self.name, error = %e, "Store operation failed, reconnecting and retrying once");
                self.retries.fetch_add(1, Ordering::Relaxed);
                if let Some(counter) = &self.retry_counter {
                    counter.inc();
                }
            }
        }

        self.try_execute(&mut slot, &mut op)
    }

    fn try_execute<T, F>(&self, slot: &mut Option<Connection>, op: &mut F) -> Result<T, DiscoError>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DiscoError::ShutDown);
        }

        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(DiscoError::Internal("store connection unavailable".to_string()));
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                Self::close(self.name, slot);
                Err(e.into())
            }
        }
    }

    /// Execute a single parameterized statement, returning the affected row count.
    pub fn execute_statement<P>(&self, sql: &str, params: P) -> Result<usize, DiscoError>
    where
        P: Params + Clone,
    {
        self.execute(|conn| conn.prepare_cached(sql)?.execute(params.clone()))
    }

    /// Execute one statement per row inside a single transaction.
    ///
    /// `bind` executes the prepared statement for one row and returns the
    /// number of affected rows. A failed batch is rolled back as a whole
    /// before the retry.
    pub fn execute_batch<R, B>(&self, sql: &str, rows: &[R], bind: B) -> Result<usize, DiscoError>
    where
        B: Fn(&mut CachedStatement<'_>, &R) -> rusqlite::Result<usize>,
    {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let mut affected = 0;
            {
                let mut stmt = tx.prepare_cached(sql)?;
                for row in rows {
                    affected += bind(&mut stmt, row)?;
                }
            }
            tx.commit()?;
            Ok(affected)
        })
    }

    /// Run a query returning a single text column.
    pub fn query_strings<P>(&self, sql: &str, params: P) -> Result<Vec<String>, DiscoError>
    where
        P: Params + Clone,
    {
        self.execute(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params.clone(), |row| row.get::<_, String>(0))?;
            let values = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(values)
        })
    }

    /// Number of reconnect-and-retry cycles performed so far.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Close the connection for good; later operations fail with
    /// [`DiscoError::ShutDown`].
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(db = self.name, retries = self.retry_count(), "Shutting down store access");
        }
        Self::close(self.name, &mut self.conn.lock());
    }

    fn close(name: &'static str, slot: &mut Option<Connection>) {
        if let Some(conn) = slot.take() {
            info!(db = name, "Closing store connection");
            if let Err((_, e)) = conn.close() {
                warn!(db = name, error = %e, "Failed to close store connection");
            }
        }
    }
}
