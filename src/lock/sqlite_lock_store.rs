use super::schema::LOCK_SCHEMA;
use super::{LockError, LockSession, LockStore};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Locks not refreshed for this long are considered abandoned by a crashed session.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Advisory locks emulated on a SQLite file shared by cooperating processes.
///
/// Every session opens its own connection. A lock is a row in
/// `advisory_locks`; the row is deleted on release or when the session is
/// dropped. While a lock is held the session refreshes its row every third of
/// the lease. A process that dies while holding a lock leaves its row behind
/// until the lease expires.
pub struct SqliteLockStore {
    db_path: PathBuf,
    lease: Duration,
    busy_timeout: Duration,
}

impl SqliteLockStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
            lease: DEFAULT_LEASE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };

        let mut conn = store
            .open_connection()
            .with_context(|| format!("Failed to open lock database at {:?}", store.db_path))?;
        open_versioned(&mut conn, &LOCK_SCHEMA, "lock")?;
        info!("Lock database ready at {:?}", store.db_path);

        Ok(store)
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn checkout(&self) -> Result<Box<dyn LockSession>, LockError> {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| LockError::Connection(e.to_string()))?
        .map_err(|e| LockError::Connection(e.to_string()))?;

        Ok(Box::new(SqliteLockSession {
            conn: Arc::new(Mutex::new(conn)),
            holder: Uuid::new_v4().to_string(),
            lease: self.lease,
            held: HashMap::new(),
        }))
    }
}

struct SqliteLockSession {
    conn: Arc<Mutex<Connection>>,
    holder: String,
    lease: Duration,
    /// Held locks and the task keeping each row fresh.
    held: HashMap<i64, JoinHandle<()>>,
}

impl SqliteLockSession {
    /// Run `f` against the session connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| LockError::Protocol(e.to_string()))?
        .map_err(|e| LockError::Protocol(e.to_string()))
    }

    fn spawn_keep_alive(&self, lock_id: i64) -> JoinHandle<()> {
        let conn = Arc::clone(&self.conn);
        let holder = self.holder.clone();
        let period = (self.lease / 3).max(MIN_REFRESH_INTERVAL);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let conn = Arc::clone(&conn);
                let holder = holder.clone();
                let refreshed = tokio::task::spawn_blocking(move || {
                    let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    refresh_row(&conn, lock_id, &holder)
                })
                .await;

                match refreshed {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => {
                        warn!(lock_id, "Advisory lock row is gone, stopping lease refresh");
                        return;
                    }
                    Ok(Err(e)) => warn!(lock_id, "Failed to refresh advisory lock lease: {}", e),
                    Err(e) => {
                        warn!(lock_id, "Advisory lock lease refresh aborted: {}", e);
                        return;
                    }
                }
            }
        })
    }
}

fn try_acquire_row(
    conn: &mut Connection,
    lock_id: i64,
    holder: &str,
    lease: Duration,
) -> rusqlite::Result<bool> {
    let now = Utc::now().timestamp();
    let stale_before = now - lease.as_secs() as i64;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let reclaimed = tx.execute(
        "DELETE FROM advisory_locks WHERE lock_id = ?1 AND holder != ?2 AND acquired_at < ?3",
        params![lock_id, holder, stale_before],
    )?;
    if reclaimed > 0 {
        warn!(lock_id, "Reclaimed expired advisory lock");
    }
    tx.execute(
        "INSERT OR IGNORE INTO advisory_locks (lock_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
        params![lock_id, holder, now],
    )?;
    let current: Option<String> = tx
        .query_row(
            "SELECT holder FROM advisory_locks WHERE lock_id = ?1",
            params![lock_id],
            |row| row.get(0),
        )
        .optional()?;
    tx.commit()?;

    Ok(current.as_deref() == Some(holder))
}

fn refresh_row(conn: &Connection, lock_id: i64, holder: &str) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE advisory_locks SET acquired_at = ?1 WHERE lock_id = ?2 AND holder = ?3",
        params![Utc::now().timestamp(), lock_id, holder],
    )?;
    Ok(updated > 0)
}

fn delete_rows(conn: &Connection, lock_ids: &[i64], holder: &str) -> rusqlite::Result<()> {
    for lock_id in lock_ids {
        conn.execute(
            "DELETE FROM advisory_locks WHERE lock_id = ?1 AND holder = ?2",
            params![lock_id, holder],
        )?;
    }
    Ok(())
}

#[async_trait]
impl LockSession for SqliteLockSession {
    async fn try_acquire(&mut self, lock_id: i64) -> Result<bool, LockError> {
        let holder = self.holder.clone();
        let lease = self.lease;
        let acquired = self
            .with_conn(move |conn| try_acquire_row(conn, lock_id, &holder, lease))
            .await?;
        if acquired && !self.held.contains_key(&lock_id) {
            let keep_alive = self.spawn_keep_alive(lock_id);
            self.held.insert(lock_id, keep_alive);
        }
        Ok(acquired)
    }

    async fn release(&mut self, lock_id: i64) -> Result<(), LockError> {
        if let Some(keep_alive) = self.held.remove(&lock_id) {
            keep_alive.abort();
        }
        let holder = self.holder.clone();
        self.with_conn(move |conn| delete_rows(conn, &[lock_id], &holder))
            .await
    }
}

impl Drop for SqliteLockSession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let lock_ids: Vec<i64> = self
            .held
            .drain()
            .map(|(lock_id, keep_alive)| {
                keep_alive.abort();
                lock_id
            })
            .collect();
        let holder = std::mem::take(&mut self.holder);
        let conn = Arc::clone(&self.conn);
        let release = move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = delete_rows(&conn, &lock_ids, &holder) {
                warn!("Failed to release advisory locks {:?} on session drop: {}", lock_ids, e);
            } else {
                debug!("Released advisory locks {:?} on session drop", lock_ids);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteLockStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteLockStore::new(dir.path().join("locks.db")).unwrap();
        (dir, store)
    }

    fn row_count(store: &SqliteLockStore) -> i64 {
        let conn = store.open_connection().unwrap();
        conn.query_row("SELECT COUNT(*) FROM advisory_locks", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_between_sessions() {
        let (_dir, store) = temp_store();
        let mut first = store.checkout().await.unwrap();
        let mut second = store.checkout().await.unwrap();

        assert!(first.try_acquire(42).await.unwrap());
        assert!(!second.try_acquire(42).await.unwrap());
        assert!(first.try_acquire(42).await.unwrap());

        first.release(42).await.unwrap();
        assert!(second.try_acquire(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_between_stores_on_same_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let store_a = SqliteLockStore::new(&path).unwrap();
        let store_b = SqliteLockStore::new(&path).unwrap();

        let mut a = store_a.checkout().await.unwrap();
        let mut b = store_b.checkout().await.unwrap();
        assert!(a.try_acquire(7).await.unwrap());
        assert!(!b.try_acquire(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_keeps_lock() {
        let (_dir, store) = temp_store();
        let mut holder = store.checkout().await.unwrap();
        let mut other = store.checkout().await.unwrap();

        assert!(holder.try_acquire(1).await.unwrap());
        other.release(1).await.unwrap();
        assert_eq!(row_count(&store), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_held_locks() {
        let (_dir, store) = temp_store();
        {
            let mut session = store.checkout().await.unwrap();
            assert!(session.try_acquire(11).await.unwrap());
        }

        for _ in 0..100 {
            if row_count(&store) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(row_count(&store), 0);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (_dir, store) = temp_store();
        let store = store.with_lease(Duration::from_secs(60));

        // Row left behind by a session that crashed long ago.
        let conn = store.open_connection().unwrap();
        conn.execute(
            "INSERT INTO advisory_locks (lock_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![5, "dead-session", Utc::now().timestamp() - 3600],
        )
        .unwrap();

        let mut session = store.checkout().await.unwrap();
        assert!(session.try_acquire(5).await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_foreign_lock_is_not_reclaimed() {
        let (_dir, store) = temp_store();
        let conn = store.open_connection().unwrap();
        conn.execute(
            "INSERT INTO advisory_locks (lock_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![5, "live-session", Utc::now().timestamp()],
        )
        .unwrap();

        let mut session = store.checkout().await.unwrap();
        assert!(!session.try_acquire(5).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_live_holder_keeps_lock_past_lease() {
        let (_dir, store) = temp_store();
        let store = store.with_lease(Duration::from_secs(1));
        let mut holder = store.checkout().await.unwrap();
        let mut contender = store.checkout().await.unwrap();

        assert!(holder.try_acquire(21).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!contender.try_acquire(21).await.unwrap());

        holder.release(21).await.unwrap();
        assert!(contender.try_acquire(21).await.unwrap());
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.db");
        SqliteLockStore::new(&path).unwrap();
        SqliteLockStore::new(&path).unwrap();
    }
}
