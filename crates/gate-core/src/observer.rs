//! Synchronous observer list with explicit unsubscribe handles.

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// Callbacks run in subscription order on the thread that triggers the event.
/// The list lock is not held while they run, so a callback may subscribe or
/// unsubscribe without deadlocking.
pub struct ObserverList<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<E> std::fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E: 'static> ObserverList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Inner<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    inner.callbacks.retain(|(cb_id, _)| *cb_id != id);
                }
            })),
        }
    }

    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl<E> ObserverList<E> {
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`ObserverList::subscribe`].
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
