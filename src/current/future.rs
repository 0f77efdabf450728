//! Context propagation across `await` points.
//!
//! A thread-local current context does not follow a future between polls:
//! the executor may run each poll on a different thread, or interleave
//! other futures on the same one. [`FutureScopeExt`] wraps a future so a
//! chosen context is made current around every poll and reverted before
//! control returns to the executor.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::TraceContext;

use super::CurrentTraceContext;

pin_project! {
    /// A future that scopes a captured context around every poll of the
    /// inner future. Built by [`FutureScopeExt`].
    pub struct WithScope<F> {
        #[pin]
        inner: F,
        current: Arc<dyn CurrentTraceContext>,
        context: Option<TraceContext>,
    }
}

impl<F: Future> Future for WithScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _scope = this.current.maybe_scope(this.context.clone());
        this.inner.poll(cx)
    }
}

impl<F> fmt::Debug for WithScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithScope")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Attaches a [`CurrentTraceContext`] scope to a future.
pub trait FutureScopeExt: Sized {
    /// Makes `context` current for every poll of this future.
    fn with_scope(
        self,
        current: Arc<dyn CurrentTraceContext>,
        context: Option<TraceContext>,
    ) -> WithScope<Self>;

    /// Captures the context current at the call and makes it current for
    /// every poll of this future.
    fn with_current_scope(self, current: Arc<dyn CurrentTraceContext>) -> WithScope<Self> {
        let context = current.get();
        self.with_scope(current, context)
    }
}

impl<F: Future> FutureScopeExt for F {
    fn with_scope(
        self,
        current: Arc<dyn CurrentTraceContext>,
        context: Option<TraceContext>,
    ) -> WithScope<Self> {
        WithScope {
            inner: self,
            current,
            context,
        }
    }
}
