//! The identity of one span, and the subsets of it that survive extraction.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;

/// Immutable identity of one span in a trace.
///
/// A `TraceContext` carries a 64- or 128-bit trace id, a span id, an optional
/// parent span id, the sampling decision (possibly still undecided) and any
/// opaque extension values attached by baggage-style propagation. It is
/// constructed through [`TraceContext::builder`] and never mutated afterwards;
/// derived contexts are new values.
///
/// Equality and hashing cover only `(trace_id_high, trace_id, span_id)`.
/// Parent ids and extension values are deliberately excluded: two extractions
/// of the same span from different hops must compare equal.
#[derive(Clone)]
pub struct TraceContext {
    trace_id_high: u64,
    trace_id: u64,
    parent_id: Option<u64>,
    span_id: u64,
    sampled: Option<bool>,
    debug: bool,
    extra: Vec<Arc<dyn Any + Send + Sync>>,
}

impl TraceContext {
    /// Starts building a new context.
    pub fn builder() -> TraceContextBuilder {
        TraceContextBuilder::default()
    }

    /// Upper 64 bits of the trace id, zero when the trace id is 64-bit.
    pub fn trace_id_high(&self) -> u64 {
        self.trace_id_high
    }

    /// Lower 64 bits of the trace id.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// The parent span id, absent for a root span.
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// The span id, never zero.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// The sampling decision: `None` means not yet decided.
    ///
    /// A debug context always reports `Some(true)`.
    pub fn sampled(&self) -> Option<bool> {
        if self.debug {
            Some(true)
        } else {
            self.sampled
        }
    }

    /// Whether this context has the debug flag, which forces sampling.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Returns the first extension value of type `T`, if one is attached.
    pub fn extra<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extra.iter().find_map(|value| value.downcast_ref())
    }

    /// All attached extension values, in attachment order.
    pub fn extra_values(&self) -> &[Arc<dyn Any + Send + Sync>] {
        &self.extra
    }

    /// Derives a child context: same trace ids and extras, the given span id,
    /// and this context's span id as the parent.
    pub fn new_child(&self, span_id: u64) -> Result<TraceContext, InvalidTraceContext> {
        if span_id == 0 {
            return Err(InvalidTraceContext::ZeroSpanId);
        }
        Ok(TraceContext {
            trace_id_high: self.trace_id_high,
            trace_id: self.trace_id,
            parent_id: Some(self.span_id),
            span_id,
            sampled: self.sampled,
            debug: self.debug,
            extra: self.extra.clone(),
        })
    }

    /// The trace id as 16 lowercase hex characters, or 32 when 128-bit.
    pub fn trace_id_string(&self) -> String {
        if self.trace_id_high != 0 {
            format!("{:016x}{:016x}", self.trace_id_high, self.trace_id)
        } else {
            format!("{:016x}", self.trace_id)
        }
    }
}

impl PartialEq for TraceContext {
    fn eq(&self, other: &Self) -> bool {
        self.trace_id_high == other.trace_id_high
            && self.trace_id == other.trace_id
            && self.span_id == other.span_id
    }
}

impl Eq for TraceContext {}

impl Hash for TraceContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.trace_id_high.hash(state);
        self.trace_id.hash(state);
        self.span_id.hash(state);
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id_string())
            .field("parent_id", &self.parent_id.map(|id| format!("{:016x}", id)))
            .field("span_id", &format_args!("{:016x}", self.span_id))
            .field("sampled", &self.sampled)
            .field("debug", &self.debug)
            .field("extra", &self.extra.len())
            .finish()
    }
}

impl fmt::Display for TraceContext {
    /// Formats as `traceId/spanId` in hex, the form used in diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}", self.trace_id_string(), self.span_id)
    }
}

/// Builds a [`TraceContext`], validating identifiers once at [`build`].
///
/// [`build`]: TraceContextBuilder::build
#[derive(Clone, Default)]
pub struct TraceContextBuilder {
    trace_id_high: u64,
    trace_id: u64,
    parent_id: Option<u64>,
    span_id: u64,
    sampled: Option<bool>,
    debug: bool,
    extra: Vec<Arc<dyn Any + Send + Sync>>,
}

impl TraceContextBuilder {
    /// Sets the upper 64 bits of a 128-bit trace id.
    pub fn trace_id_high(mut self, trace_id_high: u64) -> Self {
        self.trace_id_high = trace_id_high;
        self
    }

    /// Sets the lower 64 bits of the trace id.
    pub fn trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Sets the parent span id.
    pub fn parent_id(mut self, parent_id: u64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the span id.
    pub fn span_id(mut self, span_id: u64) -> Self {
        self.span_id = span_id;
        self
    }

    /// Sets the sampling decision. Leaving it unset defers the decision.
    pub fn sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    /// Sets the debug flag. Debug implies sampled.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Attaches an opaque extension value, propagated by reference.
    pub fn extra<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extra.push(Arc::new(value));
        self
    }

    /// Validates and builds the context.
    ///
    /// An all-zero trace id or a zero span id is rejected; such values are
    /// reserved as "absent" on the wire.
    pub fn build(self) -> Result<TraceContext, InvalidTraceContext> {
        if self.trace_id_high == 0 && self.trace_id == 0 {
            return Err(InvalidTraceContext::ZeroTraceId);
        }
        if self.span_id == 0 {
            return Err(InvalidTraceContext::ZeroSpanId);
        }
        Ok(TraceContext {
            trace_id_high: self.trace_id_high,
            trace_id: self.trace_id,
            parent_id: self.parent_id,
            span_id: self.span_id,
            sampled: self.sampled,
            debug: self.debug,
            extra: self.extra,
        })
    }
}

impl fmt::Debug for TraceContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContextBuilder")
            .field("trace_id_high", &self.trace_id_high)
            .field("trace_id", &self.trace_id)
            .field("parent_id", &self.parent_id)
            .field("span_id", &self.span_id)
            .field("sampled", &self.sampled)
            .field("debug", &self.debug)
            .field("extra", &self.extra.len())
            .finish()
    }
}

/// Error building a [`TraceContext`] from invalid identifiers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidTraceContext {
    /// The trace id was all zeros.
    #[error("trace id cannot be all zeros")]
    ZeroTraceId,
    /// The span id was zero.
    #[error("span id cannot be zero")]
    ZeroSpanId,
}

/// The sampled/debug subset of a [`TraceContext`].
///
/// Produced when extraction yields a decision but no usable identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplingFlags {
    sampled: Option<bool>,
    debug: bool,
}

impl SamplingFlags {
    /// No decision, not debug.
    pub const EMPTY: SamplingFlags = SamplingFlags {
        sampled: None,
        debug: false,
    };
    /// Sampled.
    pub const SAMPLED: SamplingFlags = SamplingFlags {
        sampled: Some(true),
        debug: false,
    };
    /// Explicitly not sampled, distinct from undecided.
    pub const NOT_SAMPLED: SamplingFlags = SamplingFlags {
        sampled: Some(false),
        debug: false,
    };
    /// Debug, which implies sampled.
    pub const DEBUG: SamplingFlags = SamplingFlags {
        sampled: Some(true),
        debug: true,
    };

    /// The sampling decision: `None` means not yet decided.
    pub fn sampled(&self) -> Option<bool> {
        if self.debug {
            Some(true)
        } else {
            self.sampled
        }
    }

    /// Whether the debug flag is set.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn from_parts(sampled: Option<bool>, debug: bool) -> SamplingFlags {
        SamplingFlags {
            sampled: if debug { Some(true) } else { sampled },
            debug,
        }
    }
}

/// What extraction found on a carrier: either a full context or bare flags.
///
/// Callers branch on the variant; there is no third state. A carrier with no
/// usable trace data at all yields [`Extraction::EMPTY`].
#[derive(Clone, Debug, PartialEq)]
pub enum Extraction {
    /// Identifiers (and possibly flags and extras) were present and valid.
    Context(TraceContext),
    /// Only a sampling decision was present, or nothing at all.
    Flags(SamplingFlags),
}

impl Extraction {
    /// The result of extracting a carrier with no usable trace data.
    pub const EMPTY: Extraction = Extraction::Flags(SamplingFlags::EMPTY);

    /// The extracted context, if identifiers were present.
    pub fn context(&self) -> Option<&TraceContext> {
        match self {
            Extraction::Context(context) => Some(context),
            Extraction::Flags(_) => None,
        }
    }

    /// The sampling decision, from either variant.
    pub fn sampled(&self) -> Option<bool> {
        match self {
            Extraction::Context(context) => context.sampled(),
            Extraction::Flags(flags) => flags.sampled(),
        }
    }

    /// True when nothing usable was extracted.
    pub fn is_empty(&self) -> bool {
        matches!(self, Extraction::Flags(flags) if *flags == SamplingFlags::EMPTY)
    }
}
