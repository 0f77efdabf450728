//! Trace context propagation over the [B3 header formats], plus in-process
//! "current span" scoping.
//!
//! Instrumentation for a client or server framework needs two things from a
//! tracing core: a way to read and write trace identifiers on a carrier
//! (HTTP headers, message properties), and a way to make the context of an
//! in-flight request ambiently visible to application code. This crate
//! provides both, and nothing else: span recording, sampling policy and
//! reporting live elsewhere.
//!
//! # Propagation
//!
//! [`B3Propagation`] encodes a [`TraceContext`] onto any carrier through a
//! caller-supplied [`Setter`], and decodes one back through a [`Getter`]:
//!
//! ```
//! use std::collections::HashMap;
//! use b3_propagation::{B3Propagation, Extraction, TraceContext};
//! use b3_propagation::propagation::{MapGetter, MapSetter};
//!
//! let context = TraceContext::builder()
//!     .trace_id(1)
//!     .parent_id(2)
//!     .span_id(3)
//!     .build()?;
//!
//! let propagation = B3Propagation::get();
//! let mut headers = HashMap::new();
//! propagation.injector(MapSetter).inject(&context, &mut headers);
//! assert_eq!(headers["X-B3-TraceId"], "0000000000000001");
//!
//! match propagation.extractor(MapGetter).extract(&headers) {
//!     Extraction::Context(extracted) => assert_eq!(extracted, context),
//!     Extraction::Flags(flags) => panic!("expected a full context, got {:?}", flags),
//! }
//! # Ok::<(), b3_propagation::InvalidTraceContext>(())
//! ```
//!
//! Extraction never fails: malformed remote input degrades to
//! [`Extraction::EMPTY`] and is logged, because tracing must not break the
//! traced application.
//!
//! # Scoping
//!
//! [`CurrentTraceContext`] makes one context current per thread until the
//! returned [`Scope`] is closed (or dropped). Scopes nest, and tasks can be
//! [wrapped][CurrentTraceContextExt::wrap] so the context at scheduling time
//! is re-established wherever the task eventually runs:
//!
//! ```
//! use std::sync::Arc;
//! use b3_propagation::{
//!     CurrentTraceContext, CurrentTraceContextExt, ThreadLocalCurrentTraceContext, TraceContext,
//! };
//!
//! let current: Arc<dyn CurrentTraceContext> = Arc::new(ThreadLocalCurrentTraceContext::new());
//! let context = TraceContext::builder().trace_id(1).span_id(2).build()?;
//!
//! let _scope = current.new_scope(Some(context.clone()));
//! let observer = Arc::clone(&current);
//! let task = current.wrap(move || observer.get());
//!
//! // the captured context follows the task onto another thread
//! let seen = std::thread::spawn(task).join().unwrap();
//! assert_eq!(seen, Some(context));
//! # Ok::<(), b3_propagation::InvalidTraceContext>(())
//! ```
//!
//! In development and tests, add a [`StrictScopeDecorator`] to detect scopes
//! closed on the wrong thread or never closed at all.
//!
//! [B3 header formats]: https://github.com/openzipkin/b3-propagation

#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod current;
pub mod propagation;
mod trace_context;

pub use current::{
    CurrentTraceContext, CurrentTraceContextExt, Scope, ScopeDecorator, StrictScopeDecorator,
    ThreadLocalCurrentTraceContext,
};
pub use propagation::{B3ConfigError, B3Propagation, Format, Getter, Kind, RemoteSetter, Setter};
pub use trace_context::{
    Extraction, InvalidTraceContext, SamplingFlags, TraceContext, TraceContextBuilder,
};
