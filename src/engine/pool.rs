// ── Merchant Memory: Connection Pool Manager ───────────────────────────────
//
// Owns every SQLite connection the memory core uses.
//
// Features:
//   • r2d2 pool sized [min, max], each connection initialised with
//     busy_timeout (lock timeout), WAL, foreign keys
//   • Bounded-concurrency gate (tokio Semaphore) in front of the pool:
//     a permit is held for the whole blocking unit of work
//   • Statement timeout: tokio timeout + SQLite interrupt on expiry
//   • Retry: busy/locked → 200ms × attempt, broken → 100ms × attempt,
//     at most `max_retries`, then StorageUnavailable
//   • Guard rolls back any transaction left open when it is dropped
//   • `close()` shuts the gate; later calls fail fast

use crate::atoms::constants::{BROKEN_BACKOFF_MS, BUSY_BACKOFF_MS};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::engine::config::DatabaseConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type SqlitePool = Pool<SqliteConnectionManager>;

// ── Error classification ───────────────────────────────────────────────────

/// How the retry loop treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lock contention. Worth waiting for.
    Busy,
    /// The connection (or the pool) is unusable. Worth a fresh checkout.
    Broken,
    /// Logical / schema / constraint errors. Never retried.
    Permanent,
}

pub fn classify(err: &MemoryError) -> ErrorClass {
    match err {
        MemoryError::Pool(_) => ErrorClass::Broken,
        MemoryError::Database(rusqlite::Error::SqliteFailure(e, _)) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorClass::Busy,
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => ErrorClass::Broken,
            _ => ErrorClass::Permanent,
        },
        _ => ErrorClass::Permanent,
    }
}

/// Linear backoff for the given class and 1-based attempt.
pub fn backoff(class: ErrorClass, attempt: u32) -> Duration {
    let unit = match class {
        ErrorClass::Busy => BUSY_BACKOFF_MS,
        ErrorClass::Broken => BROKEN_BACKOFF_MS,
        ErrorClass::Permanent => 0,
    };
    Duration::from_millis(unit * attempt as u64)
}

// ── Guard ──────────────────────────────────────────────────────────────────

/// A checked-out connection. Derefs to `rusqlite::Connection`.
/// Dropping it returns the connection to the pool (rolling back any
/// transaction left open) and releases the gate permit, if it holds one.
pub struct ConnectionGuard {
    conn: PooledConnection<SqliteConnectionManager>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    fn new(conn: PooledConnection<SqliteConnectionManager>, permit: Option<OwnedSemaphorePermit>) -> Self {
        ConnectionGuard { conn, _permit: permit }
    }
}

impl Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for ConnectionGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            warn!("[pool] Connection returned with an open transaction, rolling back");
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("[pool] Rollback on release failed: {}", e);
            }
        }
    }
}

// ── Status ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
    pub available_permits: usize,
    pub closed: bool,
}

// ── Pool ───────────────────────────────────────────────────────────────────

/// Hand-off between the timeout watcher and the blocking task.
enum Interrupt {
    Pending,
    Armed(InterruptHandle),
    Cancelled,
}

pub struct ConnectionPool {
    pool: SqlitePool,
    gate: Arc<Semaphore>,
    config: DatabaseConfig,
}

impl ConnectionPool {
    /// Build the pool. Blocks until `min_connections` are open, so call it
    /// from a blocking context when inside the runtime.
    pub fn open(config: &DatabaseConfig) -> MemoryResult<Self> {
        let lock_timeout = config.lock_timeout();
        let in_memory = config.is_in_memory();

        let manager = if in_memory {
            // Shared cache so every pooled connection sees the same database;
            // a unique name keeps separate pools apart.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqliteConnectionManager::file(&config.path)
        };
        let manager = manager.with_init(move |c| {
            c.busy_timeout(lock_timeout)?;
            c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            Ok(())
        });

        let mut builder = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(config.acquire_timeout());
        if in_memory {
            // The database lives only as long as one connection does.
            builder = builder
                .min_idle(Some(config.min_connections.max(1)))
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            builder = builder
                .min_idle(Some(config.min_connections))
                .idle_timeout(Some(config.idle_timeout()));
        }
        let pool = builder.build(manager)?;

        info!(
            "[pool] Opened {} (connections {}..{}, {} permits)",
            if in_memory { "in-memory database" } else { config.path.as_str() },
            config.min_connections,
            config.max_connections,
            config.concurrency_limit
        );

        Ok(ConnectionPool {
            pool,
            gate: Arc::new(Semaphore::new(config.concurrency_limit)),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Check out a connection under a gate permit. The guard releases both.
    pub async fn acquire(&self) -> MemoryResult<ConnectionGuard> {
        let permit = self.permit("acquire").await?;
        let pool = self.pool.clone();
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| MemoryError::Other(format!("connection checkout task failed: {}", e)))?
            .map_err(|e| MemoryError::storage_unavailable("acquire", 1, e.to_string()))?;
        Ok(ConnectionGuard::new(conn, Some(permit)))
    }

    /// Run `f` on a pooled connection on the blocking thread pool, under a
    /// gate permit and the statement timeout, retrying transient failures.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> MemoryResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> MemoryResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.run_once(op, attempt, Arc::clone(&f)).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let class = classify(&err);
            if class == ErrorClass::Permanent {
                return Err(err);
            }
            if attempt > self.config.max_retries {
                warn!("[pool] {} gave up after {} attempt(s): {}", op, attempt, err);
                return Err(MemoryError::storage_unavailable(op, attempt, err.to_string()));
            }
            let delay = backoff(class, attempt);
            warn!(
                "[pool] {} failed ({:?}, attempt {}), retrying in {}ms: {}",
                op,
                class,
                attempt,
                delay.as_millis(),
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once<T, F>(&self, op: &'static str, attempt: u32, f: Arc<F>) -> MemoryResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> MemoryResult<T> + Send + Sync + 'static,
    {
        let permit = self.permit(op).await?;
        let pool = self.pool.clone();
        let interrupt: Arc<Mutex<Interrupt>> = Arc::new(Mutex::new(Interrupt::Pending));
        let interrupt_slot = Arc::clone(&interrupt);

        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = ConnectionGuard::new(pool.get()?, Some(permit));
            {
                let mut slot = interrupt_slot.lock();
                if matches!(*slot, Interrupt::Cancelled) {
                    return Err(MemoryError::storage_unavailable(op, attempt, "cancelled before start"));
                }
                *slot = Interrupt::Armed(guard.get_interrupt_handle());
            }
            f(&mut *guard)
        });

        match tokio::time::timeout(self.config.statement_timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(MemoryError::Other(format!("{} task failed: {}", op, join_err))),
            Err(_) => {
                let mut slot = interrupt.lock();
                if let Interrupt::Armed(handle) = &*slot {
                    handle.interrupt();
                }
                *slot = Interrupt::Cancelled;
                drop(slot);
                warn!(
                    "[pool] {} exceeded statement timeout of {}ms, interrupted",
                    op, self.config.statement_timeout_ms
                );
                Err(MemoryError::storage_unavailable(
                    op,
                    attempt,
                    format!("statement timeout after {}ms", self.config.statement_timeout_ms),
                ))
            }
        }
    }

    async fn permit(&self, op: &'static str) -> MemoryResult<OwnedSemaphorePermit> {
        if self.gate.available_permits() == 0 {
            debug!("[pool] {} waiting for a permit", op);
        }
        Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| MemoryError::storage_unavailable(op, 0, "connection pool is closed"))
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_connections: self.config.max_connections,
            available_permits: self.gate.available_permits(),
            closed: self.gate.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Shut the gate. Work already holding a permit finishes; everything
    /// after fails with `StorageUnavailable`. Connections close as the last
    /// handle to the pool drops.
    pub fn close(&self) {
        if !self.gate.is_closed() {
            self.gate.close();
            info!("[pool] Closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn sqlite_err(code: i32) -> MemoryError {
        MemoryError::Database(rusqlite::Error::SqliteFailure(ffi::Error::new(code), None))
    }

    fn test_pool() -> ConnectionPool {
        ConnectionPool::open(&DatabaseConfig::in_memory()).unwrap()
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&sqlite_err(ffi::SQLITE_BUSY)), ErrorClass::Busy);
        assert_eq!(classify(&sqlite_err(ffi::SQLITE_LOCKED)), ErrorClass::Busy);
        assert_eq!(classify(&sqlite_err(ffi::SQLITE_CANTOPEN)), ErrorClass::Broken);
        assert_eq!(classify(&sqlite_err(ffi::SQLITE_IOERR)), ErrorClass::Broken);
        assert_eq!(classify(&sqlite_err(ffi::SQLITE_CONSTRAINT)), ErrorClass::Permanent);
        assert_eq!(classify(&MemoryError::not_found("m")), ErrorClass::Permanent);
        assert_eq!(
            classify(&MemoryError::storage_unavailable("x", 1, "timeout")),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn backoff_is_linear_per_class() {
        assert_eq!(backoff(ErrorClass::Broken, 1), Duration::from_millis(100));
        assert_eq!(backoff(ErrorClass::Broken, 3), Duration::from_millis(300));
        assert_eq!(backoff(ErrorClass::Busy, 2), Duration::from_millis(400));
        assert_eq!(backoff(ErrorClass::Permanent, 5), Duration::ZERO);
    }

    #[tokio::test]
    async fn run_executes_on_pooled_connection() {
        let pool = test_pool();
        let v: i64 = pool
            .run("select_one", |c| Ok(c.query_row("SELECT 41 + 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(v, 42);
        assert_eq!(pool.status().available_permits, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gate_caps_operations_in_flight() {
        let mut cfg = DatabaseConfig::in_memory();
        cfg.concurrency_limit = 2;
        let pool = Arc::new(ConnectionPool::open(&cfg).unwrap());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..cfg.concurrency_limit + 2 {
            let pool = Arc::clone(&pool);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                pool.run("hold", move |_c| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=cfg.concurrency_limit).contains(&peak), "peak in flight {}", peak);
        assert_eq!(pool.status().available_permits, cfg.concurrency_limit);
    }

    #[tokio::test]
    async fn connections_share_one_in_memory_database() {
        let pool = test_pool();
        pool.run("create", |c| {
            c.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .await
        .unwrap();
        let guard = pool.acquire().await.unwrap();
        let x: i64 = guard.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
    }

    #[tokio::test]
    async fn busy_errors_are_retried() {
        let pool = test_pool();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let v = pool
            .run("flaky", move |_c| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(sqlite_err(ffi::SQLITE_BUSY))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(v, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhaust_into_storage_unavailable() {
        let mut cfg = DatabaseConfig::in_memory();
        cfg.max_retries = 1;
        let pool = ConnectionPool::open(&cfg).unwrap();
        let err = pool
            .run::<(), _>("always_broken", |_c| Err(sqlite_err(ffi::SQLITE_IOERR)))
            .await
            .unwrap_err();
        match err {
            MemoryError::StorageUnavailable { op, attempts, .. } => {
                assert_eq!(op, "always_broken");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn logical_errors_are_not_retried() {
        let pool = test_pool();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let err = pool
            .run::<(), _>("missing", move |_c| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(MemoryError::not_found("m1"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn statement_timeout_interrupts_runaway_query() {
        let mut cfg = DatabaseConfig::in_memory();
        cfg.statement_timeout_ms = 200;
        let pool = ConnectionPool::open(&cfg).unwrap();
        let err = pool
            .run::<i64, _>("runaway", |c| {
                Ok(c.query_row(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("statement timeout"));
    }

    #[tokio::test]
    async fn guard_rolls_back_open_transaction() {
        let pool = test_pool();
        pool.run("create", |c| Ok(c.execute_batch("CREATE TABLE t (x INTEGER)")?))
            .await
            .unwrap();
        {
            let guard = pool.acquire().await.unwrap();
            guard.execute_batch("BEGIN; INSERT INTO t VALUES (1);").unwrap();
            assert!(!guard.is_autocommit());
        }
        let n: i64 = pool
            .run("count", |c| Ok(c.query_row("SELECT count(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = test_pool();
        pool.close();
        assert!(pool.status().closed);
        let err = pool.run("after_close", |_c| Ok(())).await.unwrap_err();
        assert!(matches!(err, MemoryError::StorageUnavailable { .. }));
        assert!(pool.acquire().await.is_err());
    }
}
