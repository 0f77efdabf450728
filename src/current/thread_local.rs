//! The standard [`CurrentTraceContext`] backed by thread-local storage.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::LocalKey;

use crate::TraceContext;

use super::{CurrentTraceContext, Scope, ScopeDecorator};

/// The thread-local cell a [`ThreadLocalCurrentTraceContext`] reads and
/// writes. Declare one with `thread_local!` to give an instance storage
/// isolated from the default.
pub type ContextSlot = RefCell<Option<TraceContext>>;

thread_local! {
    static DEFAULT_SLOT: ContextSlot = const { RefCell::new(None) };
}

/// [`CurrentTraceContext`] that stores the context in a thread-local slot.
///
/// Instances built with [`new`] (or `default`) all share one process-wide
/// slot, so independently-configured libraries observe each other's scopes.
/// Pass a dedicated slot to [the builder][ThreadLocalCurrentTraceContext::builder]
/// when isolation is wanted, as tests usually do.
///
/// [`new`]: ThreadLocalCurrentTraceContext::new
#[derive(Clone)]
pub struct ThreadLocalCurrentTraceContext {
    slot: &'static LocalKey<ContextSlot>,
    decorators: Arc<[Arc<dyn ScopeDecorator>]>,
}

impl ThreadLocalCurrentTraceContext {
    /// An instance over the shared default slot, with no decorators.
    pub fn new() -> ThreadLocalCurrentTraceContext {
        ThreadLocalCurrentTraceContext::builder().build()
    }

    /// Starts building an instance with a custom slot or decorators.
    pub fn builder() -> ThreadLocalCurrentTraceContextBuilder {
        ThreadLocalCurrentTraceContextBuilder::default()
    }
}

impl Default for ThreadLocalCurrentTraceContext {
    fn default() -> Self {
        ThreadLocalCurrentTraceContext::new()
    }
}

impl CurrentTraceContext for ThreadLocalCurrentTraceContext {
    fn get(&self) -> Option<TraceContext> {
        self.slot.with(|slot| slot.borrow().clone())
    }

    fn new_scope(&self, context: Option<TraceContext>) -> Scope {
        let previous = self.slot.with(|slot| slot.replace(context.clone()));
        let slot = self.slot;
        let scope = Scope::new(move || {
            slot.with(|slot| *slot.borrow_mut() = previous);
        });
        self.decorate_scope(context.as_ref(), scope)
    }

    fn decorate_scope(&self, context: Option<&TraceContext>, scope: Scope) -> Scope {
        self.decorators
            .iter()
            .fold(scope, |scope, decorator| {
                decorator.decorate_scope(context, scope)
            })
    }
}

impl fmt::Debug for ThreadLocalCurrentTraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalCurrentTraceContext")
            .field("decorators", &self.decorators.len())
            .finish_non_exhaustive()
    }
}

/// Builds a [`ThreadLocalCurrentTraceContext`].
#[derive(Default)]
pub struct ThreadLocalCurrentTraceContextBuilder {
    slot: Option<&'static LocalKey<ContextSlot>>,
    decorators: Vec<Arc<dyn ScopeDecorator>>,
}

impl ThreadLocalCurrentTraceContextBuilder {
    /// Uses `slot` instead of the shared default slot.
    pub fn slot(mut self, slot: &'static LocalKey<ContextSlot>) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Adds a decorator applied to every scope, in addition order.
    pub fn add_scope_decorator(mut self, decorator: impl ScopeDecorator + 'static) -> Self {
        self.decorators.push(Arc::new(decorator));
        self
    }

    /// Builds the instance.
    pub fn build(self) -> ThreadLocalCurrentTraceContext {
        ThreadLocalCurrentTraceContext {
            slot: self.slot.unwrap_or(&DEFAULT_SLOT),
            decorators: self.decorators.into(),
        }
    }
}

impl fmt::Debug for ThreadLocalCurrentTraceContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalCurrentTraceContextBuilder")
            .field("custom_slot", &self.slot.is_some())
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current::CurrentTraceContextExt;

    thread_local! {
        static ISOLATED: ContextSlot = const { RefCell::new(None) };
        static OTHER: ContextSlot = const { RefCell::new(None) };
    }

    fn isolated() -> ThreadLocalCurrentTraceContext {
        ThreadLocalCurrentTraceContext::builder()
            .slot(&ISOLATED)
            .build()
    }

    fn context(span_id: u64) -> TraceContext {
        TraceContext::builder()
            .trace_id(1)
            .span_id(span_id)
            .build()
            .unwrap()
    }

    #[test]
    fn scopes_nest_and_restore() {
        let current = isolated();
        assert_eq!(current.get(), None);

        let outer = context(2);
        let inner = context(3);
        {
            let _outer = current.new_scope(Some(outer.clone()));
            assert_eq!(current.get(), Some(outer.clone()));
            {
                let _inner = current.new_scope(Some(inner.clone()));
                assert_eq!(current.get(), Some(inner));
            }
            assert_eq!(current.get(), Some(outer));
        }
        assert_eq!(current.get(), None);
    }

    #[test]
    fn new_scope_none_clears() {
        let current = isolated();
        let _outer = current.new_scope(Some(context(2)));
        {
            let _cleared = current.new_scope(None);
            assert_eq!(current.get(), None);
        }
        assert_eq!(current.get(), Some(context(2)));
    }

    #[test]
    fn maybe_scope_is_noop_when_unchanged() {
        let current = isolated();
        let scope = current.maybe_scope(None);
        assert!(scope.is_noop());
        drop(scope);

        let _outer = current.new_scope(Some(context(2)));
        let scope = current.maybe_scope(Some(context(2)));
        assert!(scope.is_noop());
        drop(scope);

        // identity is trace/span ids only; a differing parent or extras
        // still count as unchanged, and are not propagated
        let same_identity = TraceContext::builder()
            .trace_id(1)
            .parent_id(9)
            .span_id(2)
            .extra("baggage")
            .build()
            .unwrap();
        let scope = current.maybe_scope(Some(same_identity));
        assert!(scope.is_noop());
        drop(scope);
        assert_eq!(current.get().unwrap().parent_id(), None);

        let scope = current.maybe_scope(Some(context(3)));
        assert!(!scope.is_noop());
        drop(scope);
    }

    #[test]
    fn default_instances_share_a_slot() {
        let a = ThreadLocalCurrentTraceContext::new();
        let b = ThreadLocalCurrentTraceContext::new();

        let _scope = a.new_scope(Some(context(2)));
        assert_eq!(b.get(), Some(context(2)));
    }

    #[test]
    fn custom_slots_are_isolated() {
        let a = isolated();
        let b = ThreadLocalCurrentTraceContext::builder().slot(&OTHER).build();

        let _scope = a.new_scope(Some(context(2)));
        assert_eq!(b.get(), None);
    }

    #[test]
    fn wrap_restores_context_in_task() {
        let current: Arc<dyn CurrentTraceContext> = Arc::new(isolated());

        let _scope = current.new_scope(Some(context(2)));
        let observer = Arc::clone(&current);
        let task = current.wrap(move || observer.get());

        let seen = std::thread::spawn(task).join().unwrap();
        assert_eq!(seen, Some(context(2)));
    }

    #[test]
    fn wrap_captures_at_wrap_time() {
        let current: Arc<ThreadLocalCurrentTraceContext> = Arc::new(isolated());

        let observer = Arc::clone(&current);
        let task = {
            let _scope = current.new_scope(Some(context(2)));
            current.wrap(move || observer.get())
        };

        // the wrapping scope is gone, but the captured context survives
        assert_eq!(current.get(), None);
        assert_eq!(task(), Some(context(2)));
        assert_eq!(current.get(), None);
    }

    #[test]
    fn decorators_apply_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CLOSES: AtomicUsize = AtomicUsize::new(0);

        struct Counting;
        impl ScopeDecorator for Counting {
            fn decorate_scope(&self, _: Option<&TraceContext>, mut scope: Scope) -> Scope {
                Scope::new(move || {
                    CLOSES.fetch_add(1, Ordering::SeqCst);
                    scope.close();
                })
            }
        }

        thread_local! {
            static SLOT: ContextSlot = const { RefCell::new(None) };
        }
        let current = ThreadLocalCurrentTraceContext::builder()
            .slot(&SLOT)
            .add_scope_decorator(Counting)
            .build();

        let scope = current.new_scope(Some(context(2)));
        assert!(!scope.is_noop());
        drop(scope);
        assert_eq!(CLOSES.load(Ordering::SeqCst), 1);
        assert_eq!(current.get(), None);

        // a noop scope from maybe_scope is still decorated
        let scope = current.maybe_scope(None);
        drop(scope);
        assert_eq!(CLOSES.load(Ordering::SeqCst), 2);
    }
}
