use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Named async mutexes created on demand.
///
/// Multi-key acquisition always goes through a sorted set, so two callers needing
/// overlapping keys take them in the same order.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub struct KeyedGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().await;
        // drop slots nobody holds or waits on
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = self.slot(key).await;
        KeyedGuard {
            _guards: vec![slot.lock_owned().await],
        }
    }

    pub async fn lock_all(&self, keys: BTreeSet<String>) -> KeyedGuard {
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let slot = self.slot(key).await;
            guards.push(slot.lock_owned().await);
        }
        KeyedGuard { _guards: guards }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}
