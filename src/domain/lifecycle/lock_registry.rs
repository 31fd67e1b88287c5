use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::utils::id::ExperimentId;

/// One exclusive lock per experiment, so transitions of unrelated
/// experiments never wait on each other. An entry only exists while some
/// caller holds or waits on it.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<ExperimentId, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    fn lock_for(&self, id: ExperimentId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    /// Runs `f` while holding the lock of experiment `id`.
    pub fn with_lock<R>(&self, id: ExperimentId, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        self.release(id);
        result
    }

    fn release(&self, id: ExperimentId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map itself still refers to an idle lock.
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
