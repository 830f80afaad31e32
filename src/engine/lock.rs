use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use ulid::Ulid;

use crate::model::ResourceKey;

use super::EngineError;

type Slots = DashMap<ResourceKey, Arc<Mutex<()>>>;

/// Proof of holding every key passed to [`ResourceLock::acquire`].
/// Dropping the token releases the keys.
pub struct LockToken {
    pub id: Ulid,
    pub keys: Vec<ResourceKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    slots: Arc<Slots>,
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.guards.clear();
        // A slot nobody holds or waits on is only referenced by the table.
        for key in &self.keys {
            self.slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Mutual exclusion over a set of resources, bounded by a timeout.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    async fn acquire(&self, keys: &[ResourceKey], timeout: Duration) -> Result<LockToken, EngineError>;

    fn release(&self, token: LockToken) {
        drop(token);
    }
}

/// In-process lock table: one async mutex per resource key.
#[derive(Default)]
pub struct LockTable {
    slots: Arc<Slots>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: ResourceKey) -> Arc<Mutex<()>> {
        self.slots.entry(key).or_default().clone()
    }
}

#[async_trait]
impl ResourceLock for LockTable {
    async fn acquire(&self, keys: &[ResourceKey], timeout: Duration) -> Result<LockToken, EngineError> {
        // Sorted acquisition order prevents deadlocks between overlapping key sets.
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let started = Instant::now();
        let slots: Vec<_> = keys.iter().map(|k| self.slot(*k)).collect();
        let acquire_all = async move {
            let mut guards = Vec::with_capacity(slots.len());
            for slot in slots {
                guards.push(slot.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(timeout, acquire_all).await {
            Ok(guards) => {
                metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                Ok(LockToken {
                    id: Ulid::new(),
                    keys,
                    guards,
                    slots: self.slots.clone(),
                })
            }
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!(?keys, ?timeout, "lock acquisition timed out");
                Err(EngineError::Concurrency(format!(
                    "timed out after {}ms waiting for resource lock",
                    timeout.as_millis()
                )))
            }
        }
    }
}
