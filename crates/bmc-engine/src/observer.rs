//! Completion notifications with persistent and one-shot listeners.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Box<dyn FnMut(&T) + Send>;

struct Slot<T> {
    id: SubscriptionId,
    once: bool,
    listener: Listener<T>,
}

pub struct Observer<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Observer<T> {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, once: bool, listener: Listener<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots().push(Slot { id, once, listener });
        id
    }

    pub fn subscribe(&self, listener: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        self.push(false, Box::new(listener))
    }

    /// The listener is dropped after its first call.
    pub fn subscribe_once(&self, listener: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        self.push(true, Box::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.slots().len()
    }

    /// Calls every listener in subscription order and returns how many ran.
    /// Listeners subscribed while publishing wait for the next event.
    pub fn publish(&self, event: &T) -> usize {
        let fired = std::mem::take(&mut *self.slots());
        let count = fired.len();
        let mut kept = Vec::with_capacity(count);
        for mut slot in fired {
            (slot.listener)(event);
            if !slot.once {
                kept.push(slot);
            }
        }
        let mut slots = self.slots();
        kept.append(&mut slots);
        *slots = kept;
        count
    }
}

impl<T: Clone + Send + 'static> Observer<T> {
    /// Subscribes now and resolves with the next published event; `None`
    /// if the observer is dropped first.
    pub fn next(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.subscribe_once(move |event: &T| {
            if let Some(tx) = tx.take() {
                // The waiter may have given up.
                let _ = tx.send(event.clone());
            }
        });
        async move { rx.await.ok() }
    }
}
