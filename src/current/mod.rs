//! In-process scoping: which [`TraceContext`] is current on this thread.
//!
//! A [`CurrentTraceContext`] stores at most one context per thread.
//! [`new_scope`] makes a context current and returns a [`Scope`] that
//! restores the previous one when closed; scopes therefore nest like a
//! stack. [`maybe_scope`] is the cheap variant instrumentation calls on
//! every request: when the requested context is already current it returns
//! a no-op scope instead of touching thread-local storage.
//!
//! [`new_scope`]: CurrentTraceContext::new_scope
//! [`maybe_scope`]: CurrentTraceContext::maybe_scope

use std::fmt;
use std::sync::Arc;

use crate::TraceContext;

#[cfg(feature = "futures")]
#[cfg_attr(docsrs, doc(cfg(feature = "futures")))]
pub mod future;
mod strict;
mod thread_local;

#[cfg(feature = "futures")]
#[cfg_attr(docsrs, doc(cfg(feature = "futures")))]
pub use future::{FutureScopeExt, WithScope};
pub use strict::StrictScopeDecorator;
pub use thread_local::{ContextSlot, ThreadLocalCurrentTraceContext, ThreadLocalCurrentTraceContextBuilder};

/// Restores the previously-current context when closed.
///
/// Dropping a scope closes it, so a scope held in a local binding is closed
/// at the end of the block even on unwind. Scopes are `Send` so that
/// closing on the wrong thread is a detectable mistake rather than a
/// compile error; see [`StrictScopeDecorator`].
#[must_use = "dropping a scope immediately reverts the current context"]
pub struct Scope {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Scope {
    /// A scope that does nothing when closed.
    pub fn noop() -> Scope {
        Scope { closer: None }
    }

    pub(crate) fn new(closer: impl FnOnce() + Send + 'static) -> Scope {
        Scope {
            closer: Some(Box::new(closer)),
        }
    }

    pub(crate) fn is_noop(&self) -> bool {
        self.closer.is_none()
    }

    /// Closes the scope now. Closing again (or dropping) is a no-op.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("noop", &self.is_noop())
            .finish()
    }
}

/// Wraps every scope a [`CurrentTraceContext`] returns, including no-op
/// scopes from [`maybe_scope`].
///
/// Decorators add cross-cutting behavior at scope boundaries: correlating
/// log fields, or misuse detection as [`StrictScopeDecorator`] does.
///
/// [`maybe_scope`]: CurrentTraceContext::maybe_scope
pub trait ScopeDecorator: Send + Sync {
    /// Returns `scope`, possibly wrapped with extra work on close.
    ///
    /// `context` is the context the scope made current, `None` when the
    /// scope cleared it.
    fn decorate_scope(&self, context: Option<&TraceContext>, scope: Scope) -> Scope;
}

/// Stores the current [`TraceContext`], usually in thread-local storage.
///
/// Implementations must be cheap to call on every request;
/// [`ThreadLocalCurrentTraceContext`] is the standard one.
pub trait CurrentTraceContext: Send + Sync {
    /// The current context on this thread, or `None` when outside any scope.
    fn get(&self) -> Option<TraceContext>;

    /// Makes `context` current (or clears it when `None`) until the
    /// returned scope is closed, which restores whatever was current before.
    fn new_scope(&self, context: Option<TraceContext>) -> Scope;

    /// Passes a scope through this instance's decorators.
    ///
    /// The default passes it through unchanged; implementations that hold
    /// decorators override this.
    fn decorate_scope(&self, context: Option<&TraceContext>, scope: Scope) -> Scope {
        let _ = context;
        scope
    }

    /// Like [`new_scope`], except a no-op scope is returned when `context`
    /// is already current. The no-op scope is still decorated.
    ///
    /// [`new_scope`]: CurrentTraceContext::new_scope
    fn maybe_scope(&self, context: Option<TraceContext>) -> Scope {
        let unchanged = match (self.get(), &context) {
            (None, None) => true,
            (Some(current), Some(next)) => current == *next,
            _ => false,
        };
        if unchanged {
            self.decorate_scope(context.as_ref(), Scope::noop())
        } else {
            self.new_scope(context)
        }
    }
}

/// Task-wrapping helpers for shared [`CurrentTraceContext`] handles.
pub trait CurrentTraceContextExt {
    /// Captures the context current at the call and returns a task that
    /// re-establishes it (via [`maybe_scope`]) around `task`, wherever the
    /// task ends up running. The scope is closed before the result is
    /// returned, even on unwind.
    ///
    /// [`maybe_scope`]: CurrentTraceContext::maybe_scope
    fn wrap<F, T>(&self, task: F) -> Box<dyn FnOnce() -> T + Send>
    where
        F: FnOnce() -> T + Send + 'static,
        T: 'static;
}

impl<C> CurrentTraceContextExt for Arc<C>
where
    C: CurrentTraceContext + ?Sized + 'static,
{
    fn wrap<F, T>(&self, task: F) -> Box<dyn FnOnce() -> T + Send>
    where
        F: FnOnce() -> T + Send + 'static,
        T: 'static,
    {
        let captured = self.get();
        let current = Arc::clone(self);
        Box::new(move || {
            let _scope = current.maybe_scope(captured);
            task()
        })
    }
}
