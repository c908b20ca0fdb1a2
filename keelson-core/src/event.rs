//! Multi-listener delegates.
//!
//! An [`Event`] fans one notification out to every registered listener, in
//! registration order. [`Event::listen`] hands back a [`Subscription`] that
//! [`Event::unlisten`] revokes. Emitting never short-circuits: every
//! listener runs, and any failures come back together as
//! [`Error::Aggregate`].
//!
//! Handlers that want several independent reactions behind one `on_close`
//! or `on_message` callback keep an `Event` per hook and emit from it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Listener<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

/// A set of listeners sharing one notification stream.
///
/// The payload type defaults to `()` for plain signals; see
/// [`Event::notify`].
pub struct Event<T = ()> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next: AtomicU64,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next: AtomicU64::new(0),
        }
    }
}

impl<T> Event<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it runs on every emit until unsubscribed.
    pub fn listen(
        &self,
        listener: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription(id)
    }

    /// Drop the listener behind `subscription`, if still registered.
    pub fn unlisten(&self, subscription: Subscription) {
        self.listeners
            .lock()
            .retain(|(id, _)| *id != subscription.0);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Run every listener on `value`, in registration order.
    ///
    /// All listeners run even when some fail; the failures are returned
    /// together as [`Error::Aggregate`]. The listener list is snapshotted
    /// before the first call, so a listener may `listen` or `unlisten` on
    /// this same event without deadlocking; additions take effect from the
    /// next emit.
    pub fn emit(&self, value: &T) -> Result<()> {
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        let mut failures = Vec::new();
        for listener in listeners {
            if let Err(err) = listener(value) {
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }
}

impl Event<()> {
    /// Emit with no payload.
    pub fn notify(&self) -> Result<()> {
        self.emit(&())
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_run_in_registration_order() {
        let event = Event::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            event.listen(move |value| {
                seen.lock().push((tag, *value));
                Ok(())
            });
        }
        event.emit(&7).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn unlisten_removes_exactly_one_listener() {
        let event = Event::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let keep = {
            let calls = Arc::clone(&calls);
            event.listen(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let drop_me = {
            let calls = Arc::clone(&calls);
            event.listen(move |_| {
                calls.fetch_add(10, Ordering::SeqCst);
                Ok(())
            })
        };

        event.unlisten(drop_me);
        event.notify().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        event.unlisten(keep);
        assert!(event.is_empty());
        event.notify().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_do_not_stop_later_listeners() {
        let event = Event::new();
        let reached = Arc::new(AtomicUsize::new(0));
        event.listen(|_| Err(Error::protocol("first failure")));
        {
            let reached = Arc::clone(&reached);
            event.listen(move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        event.listen(|_| Err(Error::protocol("second failure")));

        let err = event.notify().unwrap_err();
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        match err {
            Error::Aggregate(failures) => {
                assert_eq!(failures.len(), 2);
                let message = Error::Aggregate(failures).to_string();
                assert!(message.contains("first failure"));
                assert!(message.contains("second failure"));
            }
            other => panic!("expected aggregate, got {other}"),
        }
    }

    #[test]
    fn listeners_may_resubscribe_during_emit() {
        let event = Arc::new(Event::<()>::new());
        let late_calls = Arc::new(AtomicUsize::new(0));
        {
            let event2 = Arc::clone(&event);
            let late_calls = Arc::clone(&late_calls);
            event.listen(move |_| {
                let late_calls = Arc::clone(&late_calls);
                event2.listen(move |_| {
                    late_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            });
        }

        // the listener added mid-emit only runs from the next emit on
        event.notify().unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        event.notify().unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }
}
