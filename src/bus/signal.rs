//! Local signal objects: an ordered list of callbacks plus `emit`.
//!
//! Callbacks run in connection order. A panicking callback is logged and
//! skipped; it never aborts the emitter or the remaining callbacks.

use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by [`Signal::connect`], used to disconnect one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Signal<T> {
    slots: Mutex<Vec<(SlotId, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slot_count())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect a callback; it will be called on every emission.
    pub fn connect(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SlotId {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Disconnect one callback. Returns false if it was not connected.
    pub fn disconnect(&self, slot: SlotId) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.iter().position(|(id, _)| *id == slot) {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Disconnect every callback.
    pub fn disconnect_all(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Call every connected callback with the given arguments.
    pub fn emit(&self, args: &T) {
        // Callbacks may connect or disconnect while we iterate.
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();

        for slot in snapshot {
            if catch_unwind(AssertUnwindSafe(|| slot(args))).is_err() {
                error!("A signal callback panicked; continuing with the next one");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_in_connection_order() {
        let signal: Signal<i32> = Signal::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = log.clone();
            signal.connect(move |value| log.lock().unwrap().push(format!("{}{}", tag, value)));
        }

        signal.emit(&1);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_disconnect_one_and_all() {
        let signal: Signal<()> = Signal::new();
        let first = signal.connect(|_| {});
        signal.connect(|_| {});
        assert_eq!(signal.slot_count(), 2);

        assert!(signal.disconnect(first));
        assert!(!signal.disconnect(first));
        assert_eq!(signal.slot_count(), 1);

        signal.disconnect_all();
        assert_eq!(signal.slot_count(), 0);
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let signal: Signal<u8> = Signal::new();
        let reached = Arc::new(Mutex::new(false));
        signal.connect(|_| panic!("broken callback"));
        let flag = reached.clone();
        signal.connect(move |_| *flag.lock().unwrap() = true);

        signal.emit(&0);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn test_callback_may_disconnect_during_emit() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let inner = signal.clone();
        signal.connect(move |_| inner.disconnect_all());
        signal.emit(&());
        assert_eq!(signal.slot_count(), 0);
    }
}
