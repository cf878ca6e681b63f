use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::event::{EventKind, StreamEvent};

/// Callback invoked for every event of the subscribed kind.
pub type Handler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<(u64, EventKind, Handler)>,
}

/// Per-processor subscriber registry.
///
/// Handlers for one kind run in subscription order. A panicking handler is
/// logged and skipped; the remaining handlers still run.
#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<Mutex<ListenerTable>>,
}

impl Listeners {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push((id, kind, Arc::new(handler)));
        Subscription {
            id,
            kind,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Removes every handler of every kind.
    pub fn remove_all_listeners(&self) {
        self.table.lock().entries.clear();
    }

    /// Number of handlers subscribed to `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Delivers `event` to its subscribers and returns how many panicked.
    ///
    /// The table lock is released before any handler runs, so handlers may
    /// subscribe or unsubscribe while being called.
    pub fn emit(&self, event: &StreamEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .table
            .lock()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();

        let mut faults = 0;
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                faults += 1;
                warn!(event = %kind, "event handler panicked; continuing with remaining handlers");
            }
        }
        faults
    }
}

/// Handle returned by [`Listeners::on`]. Dropping it keeps the handler.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    table: Weak<Mutex<ListenerTable>>,
}

impl Subscription {
    /// Event kind the handler is subscribed to.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes this handler. Returns false if it was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = table.lock();
        let before = table.entries.len();
        table.entries.retain(|(id, _, _)| *id != self.id);
        table.entries.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeltaEvent, ErrorEvent, ErrorKind};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Listeners) {
        (Arc::new(Mutex::new(Vec::new())), Listeners::new())
    }

    #[test]
    fn handlers_run_in_subscription_order_per_kind() {
        let (log, listeners) = recorder();
        for name in ["first", "second"] {
            let log = log.clone();
            listeners.on(EventKind::Delta, move |_| log.lock().push(name.to_string()));
        }
        let log_err = log.clone();
        listeners.on(EventKind::Error, move |_| log_err.lock().push("error".into()));

        listeners.emit(&StreamEvent::Delta(DeltaEvent::content("x")));
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let (log, listeners) = recorder();
        listeners.on(EventKind::Delta, |_| panic!("handler bug"));
        let log2 = log.clone();
        listeners.on(EventKind::Delta, move |e| {
            if let StreamEvent::Delta(d) = e {
                log2.lock().push(d.text().to_string());
            }
        });
        let faults = listeners.emit(&StreamEvent::Delta(DeltaEvent::content("still here")));
        assert_eq!(faults, 1);
        assert_eq!(*log.lock(), vec!["still here"]);
    }

    #[test]
    fn unsubscribe_and_remove_all() {
        let listeners = Listeners::new();
        let sub = listeners.on(EventKind::Error, |_| {});
        listeners.on(EventKind::Error, |_| {});
        assert_eq!(listeners.count(EventKind::Error), 2);
        assert!(sub.unsubscribe());
        assert_eq!(listeners.count(EventKind::Error), 1);

        let sub = listeners.on(EventKind::Start, |_| {});
        listeners.remove_all_listeners();
        assert_eq!(listeners.count(EventKind::Error), 0);
        assert!(!sub.unsubscribe());
        assert_eq!(
            listeners.emit(&StreamEvent::Error(ErrorEvent::new(ErrorKind::Peer, "x"))),
            0
        );
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let listeners = Listeners::new();
        let inner = listeners.clone();
        listeners.on(EventKind::Delta, move |_| {
            inner.on(EventKind::Delta, |_| {});
        });
        listeners.emit(&StreamEvent::Delta(DeltaEvent::content("a")));
        assert_eq!(listeners.count(EventKind::Delta), 2);
    }
}
