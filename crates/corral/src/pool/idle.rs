use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use super::slot::Slot;

const POISONED: &str = "BUG: idle queue mutex poisoned";
const NO_SLOT: &str = "BUG: permit issued with no queued session";

/// LIFO queue of idle slots paired with a fair permit counter.
///
/// Releasers push to the front and waiters pop from the front, so the most
/// recently used session is reused first and the cold tail ages out for the
/// watcher to prune. The semaphore is the sole rendezvous between the two
/// sides: one permit corresponds to one queued slot, and tokio's semaphore
/// queues waiters first-come first-serve, which is what makes acquisition
/// fair under contention.
pub(super) struct IdleQueue<S> {
    slots: Mutex<VecDeque<Arc<Slot<S>>>>,
    permits: Semaphore,
}

/// Outcome of the watcher's attempt to remove the tail slot.
pub(super) enum Steal<S> {
    Taken(Arc<Slot<S>>),
    /// No permit available without waiting; the tail has been promised to
    /// an acquirer.
    Busy,
    /// The tail is no longer the slot that was peeked at.
    Changed,
}

impl<S> IdleQueue<S> {
    pub(super) fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.slots.lock().expect(POISONED).len()
    }

    /// Push a slot back for reuse and wake one waiter.
    ///
    /// The push must happen before the permit is released so that a woken
    /// waiter always finds a slot.
    pub(super) fn return_slot(&self, slot: Arc<Slot<S>>) {
        self.slots.lock().expect(POISONED).push_front(slot);
        self.permits.add_permits(1);
    }

    /// A permit always pairs with a queued slot, except in the window
    /// where `close()` drains the queue out from under a woken waiter, so
    /// an empty pop is reported rather than treated as a bug.
    fn pop_front(&self) -> Option<Arc<Slot<S>>> {
        self.slots.lock().expect(POISONED).pop_front()
    }

    /// Take the most recently released slot, waiting at most `budget` for
    /// a permit. Returns `None` on timeout.
    pub(super) async fn take_slot(&self, budget: Duration) -> Option<Arc<Slot<S>>> {
        let permit = match tokio::time::timeout(budget, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            // the semaphore is never closed; Err can only be the timeout
            Ok(Err(_)) | Err(_) => return None,
        };
        permit.forget();
        self.pop_front()
    }

    /// Take the most recently released slot, waiting indefinitely. The
    /// caller bounds the wait with its own deadline and close event.
    pub(super) async fn wait_slot(&self) -> Option<Arc<Slot<S>>> {
        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };
        permit.forget();
        self.pop_front()
    }

    /// Take a slot only if one is free right now.
    pub(super) fn try_take_slot(&self) -> Option<Arc<Slot<S>>> {
        let permit = self.permits.try_acquire().ok()?;
        permit.forget();
        self.pop_front()
    }

    /// The watcher's view of the oldest idle slot: its id and how long it
    /// has been idle.
    pub(super) fn peek_oldest(&self) -> Option<(u64, Duration)> {
        self.slots
            .lock()
            .expect(POISONED)
            .back()
            .map(|slot| (slot.id, slot.wait_elapsed()))
    }

    /// Atomically claim a permit and remove the tail, but only if the tail
    /// is still the slot that was peeked at. A slot already promised to a
    /// waiter is never removed: the permit claim fails first.
    pub(super) fn steal_oldest(&self, expected_id: u64) -> Steal<S> {
        let permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return Steal::Busy,
        };
        let mut slots = self.slots.lock().expect(POISONED);
        let tail_matches = slots.back().is_some_and(|tail| tail.id == expected_id);
        if tail_matches {
            let slot = slots.pop_back().expect(NO_SLOT);
            permit.forget();
            Steal::Taken(slot)
        } else {
            // dropping the permit returns it
            Steal::Changed
        }
    }

    /// Empty the queue, leaving any outstanding permits stale. Only valid
    /// once the pool is closed and no new waiters can arrive.
    pub(super) fn drain(&self) -> Vec<Arc<Slot<S>>> {
        self.slots.lock().expect(POISONED).drain(..).collect()
    }
}
