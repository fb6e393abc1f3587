use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Per-key async mutexes. Holders of different keys never contend.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.entry(key.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

/// Keys currently being worked on outside a lock.
#[derive(Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Returns false if `key` is already reserved.
    pub fn try_reserve(&self, key: &str) -> bool {
        match self.keys.lock() {
            Ok(mut keys) => keys.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        }
    }

    pub fn release(&self, key: &str) {
        match self.keys.lock() {
            Ok(mut keys) => keys.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
    }
}
