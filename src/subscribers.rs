// Subscribers: typed one-to-many callback registries
//
// Each component exposes one registry per event name, bound to a fixed
// payload type. Dispatch isolates every callback: a panicking subscriber is
// logged and skipped, its siblings still run and later events are delivered
// as usual.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Ids are unique across every registry in the process so a component can
/// offer a single `unsubscribe(id)` for all of its events.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback<E> = Box<dyn FnMut(&E)>;

/// Callback registry for a single event name.
pub struct Subscribers<E> {
    name: &'static str,
    callbacks: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Subscribers<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) + 'static,
    {
        let id = SubscriptionId::next();
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        before != self.callbacks.len()
    }

    /// Deliver `event` to every subscriber in registration order.
    ///
    /// Returns the number of callbacks that panicked.
    pub fn emit(&mut self, event: &E) -> usize {
        let mut failures = 0;
        for (id, callback) in self.callbacks.iter_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if let Err(payload) = outcome {
                failures += 1;
                log::error!(
                    "[Subscribers] '{}' subscriber {:?} failed: {}",
                    self.name,
                    id,
                    panic_message(payload.as_ref())
                );
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
