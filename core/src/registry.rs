use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::task::{TransferId, TransferStatus};

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    paused: bool,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct Control {
    flags: Mutex<Flags>,
    signal: Condvar,
}

impl Control {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags();
        f(&mut flags);
        self.signal.notify_all();
    }
}

/// Pause and cancel flags for every live transfer, keyed by URL.
///
/// Each entry owns its own condition variable so a paused transfer parks
/// until a resume or cancel for that identifier arrives. Identifiers without
/// an entry read as "not paused, not cancelled" and control calls on them do
/// nothing.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<TransferId, Arc<Control>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TransferId, Arc<Control>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self, id: &str) -> Option<Arc<Control>> {
        self.entries().get(id).cloned()
    }

    fn is_current(&self, id: &str, control: &Arc<Control>) -> bool {
        self.entries()
            .get(id)
            .map(|current| Arc::ptr_eq(current, control))
            .unwrap_or(false)
    }

    /// Create the entry for `id`, or reset an existing one to the default state.
    pub fn register(&self, id: &str) {
        let control = Arc::clone(self.entries().entry(id.to_string()).or_default());
        control.update(|flags| *flags = Flags::default());
    }

    pub fn set_paused(&self, id: &str, paused: bool) {
        if let Some(control) = self.control(id) {
            control.update(|flags| flags.paused = paused);
        }
    }

    pub fn set_cancelled(&self, id: &str) {
        if let Some(control) = self.control(id) {
            control.update(|flags| flags.cancel_requested = true);
        }
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.control(id)
            .map(|control| control.flags().paused)
            .unwrap_or(false)
    }

    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.control(id)
            .map(|control| control.flags().cancel_requested)
            .unwrap_or(false)
    }

    /// Drop the entry. Wakes anything still parked on it.
    pub fn clear(&self, id: &str) {
        let removed = self.entries().remove(id);
        if let Some(control) = removed {
            control.update(|_| {});
        }
    }

    pub fn pause_all(&self, paused: bool) {
        for id in self.active_ids() {
            self.set_paused(&id, paused);
        }
    }

    pub fn cancel_all(&self) {
        for id in self.active_ids() {
            self.set_cancelled(&id);
        }
    }

    pub fn active_ids(&self) -> Vec<TransferId> {
        self.entries().keys().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<TransferStatus> {
        let control = self.control(id)?;
        let flags = *control.flags();
        if flags.paused {
            Some(TransferStatus::Paused)
        } else {
            Some(TransferStatus::Streaming)
        }
    }

    /// Block while `id` is paused. Returns whether cancellation was requested.
    ///
    /// Returns immediately when the entry is missing or gets cleared while
    /// parked. A second transfer registering the same URL releases the parked
    /// one as not cancelled, since both share one entry.
    pub fn wait_while_paused(&self, id: &str) -> bool {
        let Some(control) = self.control(id) else {
            return false;
        };
        let mut flags = control.flags();
        while flags.paused && !flags.cancel_requested {
            flags = control
                .signal
                .wait(flags)
                .unwrap_or_else(PoisonError::into_inner);
            if flags.paused && !self.is_current(id, &control) {
                return false;
            }
        }
        flags.cancel_requested
    }
}
