//! Per-item subscriber registry
//!
//! Subscribers are attached and detached explicitly under a mutex so that the
//! at-most-once guarantee of one-shot subscriptions can be checked in one
//! place: the decision to deliver is taken while the registry lock is held,
//! and a one-shot entry is consumed for the run in the same critical section.

use super::{EventKind, ItemEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked with an item's timing or mode-change event
pub type ItemHandler = Arc<dyn Fn(&ItemEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to detach the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    once: bool,
    /// Scheduling run in which this one-shot entry last fired
    fired_in_run: Option<u64>,
    handler: ItemHandler,
}

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriberRegistry {
    pub(crate) fn add(&self, kind: EventKind, once: bool, handler: ItemHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(Subscription {
            id,
            kind,
            once,
            fired_in_run: None,
            handler,
        });
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Select the handlers to invoke for `kind`
    ///
    /// With a run number, one-shot entries fire at most once per run. Without
    /// one (events raised outside a scheduling run), one-shot entries are
    /// removed as they are selected.
    pub(crate) fn take_for(&self, kind: EventKind, run: Option<u64>) -> Vec<ItemHandler> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut selected = Vec::new();

        entries.retain_mut(|s| {
            if s.kind != kind {
                return true;
            }
            if !s.once {
                selected.push(Arc::clone(&s.handler));
                return true;
            }
            match run {
                Some(run) if s.fired_in_run == Some(run) => true,
                Some(run) => {
                    s.fired_in_run = Some(run);
                    selected.push(Arc::clone(&s.handler));
                    true
                }
                None => {
                    selected.push(Arc::clone(&s.handler));
                    false
                }
            }
        });

        selected
    }
}
