use super::{LockError, LockSession, LockStore};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::collections::HashSet;
use tracing::warn;

/// Fleet-wide locks on top of PostgreSQL session-level advisory locks.
///
/// Each session pins one pooled connection; `pg_try_advisory_lock` and
/// `pg_advisory_unlock` must run on the same connection.
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LockError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn checkout(&self) -> Result<Box<dyn LockSession>, LockError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Box::new(PgLockSession {
            conn: Some(conn),
            held: HashSet::new(),
        }))
    }
}

struct PgLockSession {
    conn: Option<PoolConnection<Postgres>>,
    held: HashSet<i64>,
}

impl PgLockSession {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, LockError> {
        self.conn
            .as_mut()
            .ok_or_else(|| LockError::Connection("session connection already closed".to_string()))
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_acquire(&mut self, lock_id: i64) -> Result<bool, LockError> {
        let conn = self.conn()?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| LockError::Protocol(e.to_string()))?;
        if acquired {
            self.held.insert(lock_id);
        }
        Ok(acquired)
    }

    async fn release(&mut self, lock_id: i64) -> Result<(), LockError> {
        let conn = self.conn()?;
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| LockError::Protocol(e.to_string()))?;
        if !released {
            warn!(lock_id, "Advisory lock was not held by this session");
        }
        self.held.remove(&lock_id);
        Ok(())
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        // A connection still holding session locks must not go back to the pool.
        // Detaching closes it and the server drops the locks.
        if !self.held.is_empty() {
            if let Some(conn) = self.conn.take() {
                warn!(locks = ?self.held, "Closing lock session that still holds advisory locks");
                drop(conn.detach());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs a reachable PostgreSQL server:
    // DATABASE_URL=postgres://... cargo test --features postgres -- --ignored
    async fn connect() -> PgLockStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgLockStore::connect(&url, 4).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_advisory_lock_is_exclusive_between_sessions() {
        let store = connect().await;
        let lock_id = 0x5EED_1234_i64;
        let mut first = store.checkout().await.unwrap();
        let mut second = store.checkout().await.unwrap();

        assert!(first.try_acquire(lock_id).await.unwrap());
        assert!(!second.try_acquire(lock_id).await.unwrap());

        first.release(lock_id).await.unwrap();
        assert!(second.try_acquire(lock_id).await.unwrap());
        second.release(lock_id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_dropped_session_frees_its_locks() {
        let store = connect().await;
        let lock_id = 0x5EED_5678_i64;
        {
            let mut session = store.checkout().await.unwrap();
            assert!(session.try_acquire(lock_id).await.unwrap());
        }

        let mut other = store.checkout().await.unwrap();
        let mut acquired = false;
        for _ in 0..50 {
            if other.try_acquire(lock_id).await.unwrap() {
                acquired = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(acquired);
        other.release(lock_id).await.unwrap();
    }
}
