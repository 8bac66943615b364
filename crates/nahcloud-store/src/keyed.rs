use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// One mutex per key, created on demand and dropped once nobody references it.
///
/// Callers on the same key run one at a time; callers on different keys only
/// share the short critical section that looks up the slot.
#[derive(Default)]
pub(crate) struct KeyedMutex {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };
        let held = Held {
            keyed: self,
            key,
            slot,
        };

        // The guarded value is `()`, so a panic in another holder leaves nothing to repair.
        let _guard = held.slot.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A claimed slot. Dropping it prunes the slot if nobody else references it,
/// including when the closure unwinds.
struct Held<'a> {
    keyed: &'a KeyedMutex,
    key: &'a str,
    slot: Arc<Mutex<()>>,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .keyed
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Clones are only handed out under `slots`, so the count is stable here.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(self.key);
        }
    }
}
