use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use sim_proto::{EventKind, SimulatorEvent};
use tracing::warn;

pub type HandlerResult = Result<(), String>;

type HandlerFn = dyn Fn(&SimulatorEvent) -> HandlerResult + Send + Sync;

/// Inbound event listener. Clones share identity, so registering the same
/// handler twice is a no-op and removal matches on identity.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SimulatorEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    fn same(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.inner))
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the handler was already registered for `kind`.
    pub fn add(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut guard = self.handlers.write();
        let entry = guard.entry(kind).or_default();
        if entry.iter().any(|existing| existing.same(handler)) {
            return false;
        }
        entry.push(handler.clone());
        true
    }

    pub fn remove(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut guard = self.handlers.write();
        let Some(entry) = guard.get_mut(&kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|existing| !existing.same(handler));
        let removed = entry.len() != before;
        if entry.is_empty() {
            guard.remove(&kind);
        }
        removed
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn contains_kind(&self, kind: EventKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Invokes every handler registered for the event's kind and returns how many ran.
    /// Handlers run against a snapshot, so they may add or remove handlers themselves.
    pub fn dispatch(&self, event: &SimulatorEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Handler> = match self.handlers.read().get(&kind) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| (handler.inner)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target: "sim.channel", kind = %kind, error = %err, "message handler failed");
                }
                Err(payload) => {
                    warn!(
                        target: "sim.channel",
                        kind = %kind,
                        panic = %panic_message(payload.as_ref()),
                        "message handler panicked"
                    );
                }
            }
        }
        snapshot.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        Handler::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = counting(&hits);

        assert!(registry.add(EventKind::Ready, &handler));
        assert!(!registry.add(EventKind::Ready, &handler.clone()));
        assert_eq!(registry.len(EventKind::Ready), 1);

        assert!(registry.remove(EventKind::Ready, &handler));
        assert!(!registry.remove(EventKind::Ready, &handler));
        assert!(!registry.contains_kind(EventKind::Ready));
    }

    #[test]
    fn multiple_handlers_per_kind_are_additive() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add(EventKind::Ready, &counting(&hits));
        registry.add(EventKind::Ready, &counting(&hits));

        assert_eq!(registry.dispatch(&SimulatorEvent::Ready), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.dispatch(&SimulatorEvent::ProgramStarted), 0);
    }

    #[test]
    fn failing_handlers_do_not_block_others() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add(EventKind::Ready, &Handler::new(|_| Err("boom".into())));
        registry.add(EventKind::Ready, &Handler::new(|_| panic!("handler exploded")));
        registry.add(EventKind::Ready, &counting(&hits));

        assert_eq!(registry.dispatch(&SimulatorEvent::Ready), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_deregister_themselves() {
        let registry = Arc::new(HandlerRegistry::new());
        let slot: Arc<parking_lot::Mutex<Option<Handler>>> = Arc::default();
        let handler = {
            let registry = Arc::clone(&registry);
            let slot = Arc::clone(&slot);
            Handler::new(move |_| {
                if let Some(me) = slot.lock().take() {
                    registry.remove(EventKind::Status, &me);
                }
                Ok(())
            })
        };
        *slot.lock() = Some(handler.clone());
        registry.add(EventKind::Status, &handler);

        let status = SimulatorEvent::Status(Default::default());
        assert_eq!(registry.dispatch(&status), 1);
        assert_eq!(registry.dispatch(&status), 0);
    }
}
