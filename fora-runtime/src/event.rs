//! Event fan-out to subscribers through a [`CallbackScheduler`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::scheduler::CallbackScheduler;

/// Handle returned by [`EventBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Delivers each broadcast value once to every current subscriber.
pub struct EventBroadcaster<T> {
    scheduler: Arc<CallbackScheduler>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: AtomicU64,
    broadcasts: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> EventBroadcaster<T> {
    /// A broadcaster delivering on `scheduler`.
    pub fn new(scheduler: Arc<CallbackScheduler>) -> Self {
        Self {
            scheduler,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
        }
    }

    /// Register `f` for future broadcasts.
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(f)));
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Number of values broadcast so far.
    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Schedule delivery of `value` to every subscriber.
    pub fn broadcast(&self, value: T) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let subs: Vec<Subscriber<T>> = self.subscribers.lock().iter().map(|(_, s)| Arc::clone(s)).collect();
        for sub in subs {
            let value = value.clone();
            self.scheduler.schedule(move || sub(&value));
        }
    }

    /// The scheduler used for delivery.
    pub fn scheduler(&self) -> &Arc<CallbackScheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_each_subscriber_once() {
        let events = EventBroadcaster::new(CallbackScheduler::inline());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        events.subscribe(move |v: &u32| s1.lock().push(("a", *v)));
        let s2 = seen.clone();
        let id = events.subscribe(move |v: &u32| s2.lock().push(("b", *v)));

        events.broadcast(1);
        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        events.broadcast(2);

        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("a", 2)]);
        assert_eq!(events.broadcast_count(), 2);
        assert_eq!(events.subscriber_count(), 1);
    }

    #[test]
    fn test_broadcast_on_worker_pool() {
        let sched = CallbackScheduler::new("events", 2);
        let events = EventBroadcaster::new(sched.clone());
        let total = Arc::new(AtomicU64::new(0));
        let t = total.clone();
        events.subscribe(move |v: &u64| {
            t.fetch_add(*v, Ordering::SeqCst);
        });
        for i in 1..=10 {
            events.broadcast(i);
        }
        sched.block_until_idle();
        assert_eq!(total.load(Ordering::SeqCst), 55);
    }
}
