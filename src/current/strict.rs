//! Scope misuse detection for development and test configurations.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, Thread, ThreadId};

use tracing::error;

use crate::TraceContext;

use super::{Scope, ScopeDecorator};

/// Panics on scope misuse instead of silently corrupting the current
/// context.
///
/// Two mistakes are caught:
///
/// * closing a scope on a different thread than opened it, which would
///   revert the wrong thread's context;
/// * never closing a scope at all, detected when [`close`] is called at
///   teardown (typically from a test harness or shutdown hook).
///
/// Every panic message names the thread that opened the scope and includes
/// the stack captured at the open site, so the offending call is easy to
/// find. No-op scopes pass through untracked. Clones share one registry.
///
/// This decorator costs a capture of the call stack per scope; keep it out
/// of production configurations.
///
/// [`close`]: StrictScopeDecorator::close
#[derive(Clone, Default)]
pub struct StrictScopeDecorator {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    open: Mutex<HashMap<u64, OpenScope>>,
    next_id: AtomicU64,
}

struct OpenScope {
    context: String,
    thread_name: String,
    opened_at: Backtrace,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, OpenScope>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, context: Option<&TraceContext>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = OpenScope {
            context: match context {
                Some(context) => context.to_string(),
                None => "empty".to_string(),
            },
            thread_name: thread_label(&thread::current()),
            opened_at: Backtrace::force_capture(),
        };
        self.lock().insert(id, entry);
        id
    }

    fn remove(&self, id: u64) -> Option<OpenScope> {
        self.lock().remove(&id)
    }
}

impl StrictScopeDecorator {
    /// A decorator with an empty registry.
    pub fn new() -> StrictScopeDecorator {
        StrictScopeDecorator::default()
    }

    /// The number of scopes opened through this decorator and not yet
    /// closed.
    pub fn open_scopes(&self) -> usize {
        self.registry.lock().len()
    }

    /// Verifies every tracked scope was closed, panicking on the first one
    /// still open. Call this at teardown, after all scopes should be done.
    pub fn close(&self) {
        let open = self.registry.lock();
        if let Some(leaked) = open.values().next() {
            panic!(
                "thread [{}] opened a scope of {} here:\n{}",
                leaked.thread_name, leaked.context, leaked.opened_at
            );
        }
    }
}

impl ScopeDecorator for StrictScopeDecorator {
    fn decorate_scope(&self, context: Option<&TraceContext>, scope: Scope) -> Scope {
        if scope.is_noop() {
            return scope;
        }

        let id = self.registry.insert(context);
        let registry = Arc::clone(&self.registry);
        let opened_on = thread::current().id();
        Scope::new(move || {
            close_tracked(&registry, id, opened_on, scope);
        })
    }
}

fn close_tracked(registry: &Registry, id: u64, opened_on: ThreadId, delegate: Scope) {
    let closing = thread::current();
    if closing.id() == opened_on {
        registry.remove(id);
        drop(delegate);
        return;
    }

    // Closing here would revert this thread's context, not the opener's.
    // Leak the delegate so neither slot is touched, then report.
    mem::forget(delegate);
    let entry = registry.remove(id);
    let opener = entry
        .as_ref()
        .map(|entry| entry.thread_name.as_str())
        .unwrap_or("unknown");
    if thread::panicking() {
        error!(
            opener,
            closer = %thread_label(&closing),
            "scope closed on the wrong thread during unwind"
        );
    } else {
        panic!(
            "thread [{}] opened scope, but thread [{}] closed it",
            opener,
            thread_label(&closing)
        );
    }
}

fn thread_label(thread: &Thread) -> String {
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

impl fmt::Debug for StrictScopeDecorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrictScopeDecorator")
            .field("open_scopes", &self.open_scopes())
            .finish()
    }
}
