//! Synchronous observer list
//!
//! Listeners run in subscription order on the emitting thread. A listener
//! that returns an error or panics is logged and skipped; the remaining
//! listeners still receive the value.

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub type ListenerError = Box<dyn Error + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&T) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by [`Observers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ObserverList<T> {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener<T>)>,
}

pub struct Observers<T> {
    list: Mutex<ObserverList<T>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            list: Mutex::new(ObserverList {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(list.next_id);
        list.next_id += 1;
        list.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.listeners.len();
        list.listeners.retain(|(existing, _)| *existing != id);
        list.listeners.len() != before
    }

    /// Deliver `value` to every listener, returning how many accepted it.
    pub fn emit(&self, value: &T) -> usize {
        // Snapshot so listeners may subscribe/unsubscribe while being called.
        let listeners: Vec<Listener<T>> = {
            let list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
            list.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        let mut delivered = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("session listener failed: {}", e),
                Err(_) => warn!("session listener panicked"),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(observers: &Observers<u32>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        observers.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn emit_reaches_all_listeners() {
        let observers = Observers::new();
        let a = counter(&observers);
        let b = counter(&observers);
        assert_eq!(observers.emit(&1), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let observers = Observers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = observers.subscribe(move |_: &u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(observers.is_empty());
    }

    #[test]
    fn failing_listener_does_not_block_later_ones() {
        let observers = Observers::new();
        observers.subscribe(|_: &u32| Err("boom".into()));
        observers.subscribe(|_: &u32| panic!("listener bug"));
        let after = counter(&observers);

        assert_eq!(observers.emit(&7), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
