use super::{LockError, LockSession, LockStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Process-local lock store.
///
/// Only coordinates tasks inside one process, which is enough for tests and
/// single-instance deployments.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    holders: Arc<Mutex<HashMap<i64, Uuid>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, lock_id: i64) -> bool {
        lock_holders(&self.holders).contains_key(&lock_id)
    }
}

fn lock_holders(holders: &Mutex<HashMap<i64, Uuid>>) -> MutexGuard<'_, HashMap<i64, Uuid>> {
    holders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn checkout(&self) -> Result<Box<dyn LockSession>, LockError> {
        Ok(Box::new(InMemorySession {
            session_id: Uuid::new_v4(),
            holders: Arc::clone(&self.holders),
            held: HashSet::new(),
        }))
    }
}

struct InMemorySession {
    session_id: Uuid,
    holders: Arc<Mutex<HashMap<i64, Uuid>>>,
    held: HashSet<i64>,
}

#[async_trait]
impl LockSession for InMemorySession {
    async fn try_acquire(&mut self, lock_id: i64) -> Result<bool, LockError> {
        let mut holders = lock_holders(&self.holders);
        let holder = *holders.entry(lock_id).or_insert(self.session_id);
        if holder != self.session_id {
            return Ok(false);
        }
        self.held.insert(lock_id);
        Ok(true)
    }

    async fn release(&mut self, lock_id: i64) -> Result<(), LockError> {
        let mut holders = lock_holders(&self.holders);
        if holders.get(&lock_id) == Some(&self.session_id) {
            holders.remove(&lock_id);
        }
        self.held.remove(&lock_id);
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let mut holders = lock_holders(&self.holders);
        for lock_id in self.held.drain() {
            if holders.get(&lock_id) == Some(&self.session_id) {
                holders.remove(&lock_id);
            }
        }
    }
}
