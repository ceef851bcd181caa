//! Routes decoded events and errors to registered handlers

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use treewatch_core::{Op, WatchError, WatchEvent};

type EventHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&WatchError) + Send + Sync>;

/// Token returned by every registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

#[derive(Clone, Copy)]
enum Route {
    Op(Op),
    All,
}

impl Route {
    fn accepts(self, op: Op) -> bool {
        match self {
            Route::Op(wanted) => wanted == op,
            Route::All => true,
        }
    }
}

#[derive(Default)]
struct Registry {
    next: u64,
    events: Vec<(Subscription, Route, EventHandler)>,
    errors: Vec<(Subscription, ErrorHandler)>,
}

impl Registry {
    fn subscription(&mut self) -> Subscription {
        self.next += 1;
        Subscription(self.next)
    }
}

/// Handler registry
///
/// Handlers run in registration order on the caller's thread. A handler that
/// panics is logged and skipped; the remaining handlers still run.
#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle events of one operation
    pub fn on_change(
        &self,
        op: Op,
        handler: impl Fn(&WatchEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_event(Route::Op(op), Arc::new(handler))
    }

    /// Handle every delivered event
    pub fn on_all(&self, handler: impl Fn(&WatchEvent) + Send + Sync + 'static) -> Subscription {
        self.add_event(Route::All, Arc::new(handler))
    }

    pub fn on_error(&self, handler: impl Fn(&WatchError) + Send + Sync + 'static) -> Subscription {
        let mut registry = self.registry.write();
        let sub = registry.subscription();
        registry.errors.push((sub, Arc::new(handler)));
        sub
    }

    /// Returns false if `sub` was not registered
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        let mut registry = self.registry.write();
        let before = registry.events.len() + registry.errors.len();
        registry.events.retain(|(s, _, _)| *s != sub);
        registry.errors.retain(|(s, _)| *s != sub);
        before != registry.events.len() + registry.errors.len()
    }

    pub fn dispatch_event(&self, event: &WatchEvent) {
        // Snapshot so handlers may register or unsubscribe while running
        let handlers: Vec<EventHandler> = self
            .registry
            .read()
            .events
            .iter()
            .filter(|(_, route, _)| route.accepts(event.op))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("{} handler panicked for {}", event.op, event.path.display());
            }
        }
    }

    pub fn dispatch_error(&self, err: &WatchError) {
        let handlers: Vec<ErrorHandler> = self
            .registry
            .read()
            .errors
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            warn!("unhandled watcher error: {}", err);
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                warn!("error handler panicked for: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&WatchEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |tag: &str| -> Box<dyn Fn(&WatchEvent) + Send + Sync> {
                let log = Arc::clone(&log);
                let tag = tag.to_string();
                Box::new(move |event: &WatchEvent| log.lock().push(format!("{}:{}", tag, event.op)))
            }
        };
        (log, make)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.on_change(Op::Create, make("first"));
        dispatcher.on_all(make("all"));
        dispatcher.on_change(Op::Create, make("second"));
        dispatcher.on_change(Op::Write, make("writes"));

        dispatcher.dispatch_event(&WatchEvent::new(Op::Create, "/a/x.txt"));
        dispatcher.dispatch_event(&WatchEvent::new(Op::Write, "/a/x.txt"));

        assert_eq!(
            *log.lock(),
            vec!["first:create", "all:create", "second:create", "all:write", "writes:write"]
        );
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.on_change(Op::Remove, |_| panic!("handler bug"));
        dispatcher.on_change(Op::Remove, make("after"));

        dispatcher.dispatch_event(&WatchEvent::new(Op::Remove, "/a/x.txt"));
        assert_eq!(*log.lock(), vec!["after:remove"]);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let sub = dispatcher.on_all(make("all"));
        assert!(dispatcher.unsubscribe(sub));
        assert!(!dispatcher.unsubscribe(sub));

        dispatcher.dispatch_event(&WatchEvent::new(Op::Create, "/a/x.txt"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_error_handlers() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher.on_error(|_| panic!("handler bug"));
        let sink = Arc::clone(&seen);
        dispatcher.on_error(move |err| sink.lock().push(err.kind()));

        dispatcher.dispatch_error(&WatchError::EngineCrashed("gone".into()));
        assert_eq!(*seen.lock(), vec![treewatch_core::ErrorKind::EngineCrashed]);
    }
}
