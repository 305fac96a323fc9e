//! Minimal named-event publish/subscribe used to fan out engine state.
//!
//! Listeners are invoked synchronously, in registration order, on the thread
//! that calls [`StateBroadcaster::emit`]. There is no replay: a listener added
//! after an emission never sees it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::error;

/// A registered listener. Keep the handle returned by `on` to unsubscribe later.
pub type Listener<P> = Arc<dyn Fn(&P) + Send + Sync>;

pub struct StateBroadcaster<P> {
    events: Mutex<HashMap<String, Vec<Listener<P>>>>,
}

impl<P> Default for StateBroadcaster<P> {
    fn default() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }
}

impl<P> StateBroadcaster<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `name`. The same closure may be registered twice.
    pub fn on<F>(&self, name: &str, listener: F) -> Listener<P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let listener: Listener<P> = Arc::new(listener);
        self.add(name, Arc::clone(&listener));
        listener
    }

    /// Register an existing handle (e.g. one previously removed with `off`).
    pub fn add(&self, name: &str, listener: Listener<P>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.entry(name.to_string()).or_default().push(listener);
    }

    /// Remove every registration of `listener` under `name`.
    pub fn off(&self, name: &str, listener: &Listener<P>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = events.get_mut(name) {
            list.retain(|l| !same_listener(l, listener));
            if list.is_empty() {
                events.remove(name);
            }
        }
    }

    /// Invoke every listener currently registered for `name`. Returns how many ran.
    ///
    /// A listener that panics is logged and skipped; the rest still run.
    pub fn emit(&self, name: &str, payload: &P) -> usize {
        // Snapshot so listeners can call on/off without deadlocking.
        let snapshot: Vec<Listener<P>> = {
            let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            match events.get(name) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        for (index, listener) in snapshot.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                error!(event = name, listener = index, "listener panicked; continuing fan-out");
            }
        }
        snapshot.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.get(name).map(Vec::len).unwrap_or(0)
    }
}

fn same_listener<P>(a: &Listener<P>, b: &Listener<P>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_in_registration_order() {
        let bus = StateBroadcaster::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            bus.on("tick", move |n: &u32| seen.lock().unwrap().push(format!("{tag}{n}")));
        }
        assert_eq!(bus.emit("tick", &7), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn off_removes_all_copies_of_a_listener() {
        let bus = StateBroadcaster::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = bus.on("x", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.add("x", Arc::clone(&handle));
        bus.emit("x", &());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        bus.off("x", &handle);
        assert_eq!(bus.listener_count("x"), 0);
        assert_eq!(bus.emit("x", &()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_siblings() {
        let bus = StateBroadcaster::<&'static str>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&hits);
        bus.on("evt", move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        bus.on("evt", |_| panic!("listener failure"));
        let last = Arc::clone(&hits);
        bus.on("evt", move |_| {
            last.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("evt", &"payload");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_listener_sees_no_past_events() {
        let bus = StateBroadcaster::<u8>::new();
        bus.emit("evt", &1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.on("evt", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let bus = Arc::new(StateBroadcaster::<()>::new());
        let slot: Arc<Mutex<Option<Listener<()>>>> = Arc::new(Mutex::new(None));
        let bus_ref = Arc::clone(&bus);
        let slot_ref = Arc::clone(&slot);
        let handle = bus.on("once", move |_| {
            if let Some(me) = slot_ref.lock().unwrap().take() {
                bus_ref.off("once", &me);
            }
        });
        *slot.lock().unwrap() = Some(handle);

        assert_eq!(bus.emit("once", &()), 1);
        assert_eq!(bus.emit("once", &()), 0);
    }
}
