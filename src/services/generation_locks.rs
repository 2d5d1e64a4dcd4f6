//! Per-fingerprint mutual exclusion for scale generation
//!
//! Concurrent requests for the same normalized parameters serialize on one
//! async mutex, so only the first runs the scaling function and the rest
//! observe its result. Entries are dropped from the registry once the last
//! holder or waiter lets go.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Registry = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Debug, Default)]
pub struct GenerationLocks {
    registry: Registry,
}

/// Held for the duration of one check-generate-commit sequence
pub struct GenerationGuard {
    key: String,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl GenerationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `fingerprint`
    pub async fn acquire(&self, fingerprint: &str) -> GenerationGuard {
        let lock = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = lock.lock_owned().await;
        GenerationGuard {
            key: fingerprint.to_string(),
            registry: Arc::clone(&self.registry),
            guard: Some(guard),
        }
    }

    /// Number of fingerprints currently held or awaited
    pub fn active(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = registry.get(&self.key)
            && Arc::strong_count(lock) == 1
        {
            registry.remove(&self.key);
        }
    }
}
