use crate::domain::record::EntityKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type LockKey = (EntityKind, String);

/// Registry size past which idle entries are pruned on the next acquisition.
const PRUNE_THRESHOLD: usize = 4096;

/// Per-entity mutual exclusion keyed by `(kind, id)`.
///
/// Guards are held for one read-modify-write cycle and must be dropped before any
/// network call. Different keys never contend.
#[derive(Clone, Default)]
pub struct EntityLocks {
    slots: Arc<Mutex<HashMap<LockKey, Arc<Mutex<()>>>>>,
}

/// Held locks; released on drop.
#[must_use]
pub struct EntityGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, kind: EntityKind, id: impl ToString) -> EntityGuard {
        self.lock_many(vec![(kind, id.to_string())]).await
    }

    /// Acquires several keys at once in a global order so callers cannot deadlock.
    pub async fn lock_many(&self, mut keys: Vec<LockKey>) -> EntityGuard {
        keys.sort();
        keys.dedup();

        let slots: Vec<Arc<Mutex<()>>> = {
            let mut map = self.slots.lock().await;
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            keys.into_iter()
                .map(|key| map.entry(key).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(slots.len());
        for slot in slots {
            guards.push(slot.lock_owned().await);
        }
        EntityGuard { _guards: guards }
    }
}
