//! Synchronous observer registries.
//!
//! Subscribers are notified in registration order. [`Registry::emit`]
//! iterates over a snapshot of the subscriber list, so a callback may
//! subscribe or unsubscribe (itself or others) while an event is being
//! delivered without disturbing the current round.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handle returned by [`Registry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Rc<dyn Fn(&E)>;

/// Subscriber list for events of type `E`.
pub struct Registry<E> {
    subscribers: RefCell<Vec<(SubscriptionId, Callback<E>)>>,
    next_id: Cell<u64>,
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Registry<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscribers.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order() {
        let registry = Registry::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let log = Rc::clone(&log);
            registry.subscribe(move |v: &u32| log.borrow_mut().push(format!("{tag}{v}")));
        }
        registry.emit(&1);
        assert_eq!(*log.borrow(), ["a1", "b1", "c1"]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let registry = Rc::new(Registry::<()>::new());
        let hits = Rc::new(Cell::new(0));
        let own_id = Rc::new(Cell::new(None));

        let first = {
            let registry = Rc::clone(&registry);
            let own_id = Rc::clone(&own_id);
            let hits = Rc::clone(&hits);
            registry.clone().subscribe(move |_| {
                hits.set(hits.get() + 1);
                if let Some(id) = own_id.get() {
                    registry.unsubscribe(id);
                }
            })
        };
        own_id.set(Some(first));
        let second_hits = Rc::new(Cell::new(0));
        {
            let second_hits = Rc::clone(&second_hits);
            registry.subscribe(move |_| second_hits.set(second_hits.get() + 1));
        }

        registry.emit(&());
        registry.emit(&());
        assert_eq!(hits.get(), 1);
        assert_eq!(second_hits.get(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unsubscribe_unknown() {
        let registry = Registry::<()>::new();
        let id = registry.subscribe(|_| {});
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
    }
}
