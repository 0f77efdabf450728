//! The B3 wire format family.
//!
//! B3 has two encodings of the same identifiers:
//!
//! 1. Single header:
//!    `b3: {traceId}-{spanId}[-{samplingFlag}][-{parentId}]`
//! 2. Multiple headers:
//!    `X-B3-TraceId`, `X-B3-SpanId`, `X-B3-ParentSpanId`, `X-B3-Sampled`,
//!    `X-B3-Flags`
//!
//! Injection is configurable per [`Kind`]; extraction always reads the
//! single header first and falls through to the multiple headers when it is
//! absent or unreadable. Remote input is never trusted: anything malformed
//! degrades to [`Extraction::EMPTY`] with a log line, never an error.

use std::fmt;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

use super::{Getter, Kind, RemoteSetter, Setter};
use crate::{Extraction, SamplingFlags, TraceContext};

const B3_SINGLE: &str = "b3";
const TRACE_ID: &str = "X-B3-TraceId";
const SPAN_ID: &str = "X-B3-SpanId";
const PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
const SAMPLED: &str = "X-B3-Sampled";
const FLAGS: &str = "X-B3-Flags";

const MULTI_KEYS: [&str; 5] = [TRACE_ID, SPAN_ID, PARENT_SPAN_ID, SAMPLED, FLAGS];

/// One of the B3 encodings, chosen per [`Kind`] at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// Writes the single `b3` header, including the parent id.
    Single,
    /// Writes the single `b3` header without a parent id, the conventional
    /// choice for messaging carriers.
    SingleNoParent,
    /// Writes the `X-B3-*` headers.
    Multi,
}

impl Format {
    fn writes_single_header(self) -> bool {
        !matches!(self, Format::Multi)
    }

    fn inject<C, S: Setter<C>>(self, context: &TraceContext, setter: &S, carrier: &mut C) {
        match self {
            Format::Single => setter.put(carrier, B3_SINGLE, encode_single(context, true)),
            Format::SingleNoParent => setter.put(carrier, B3_SINGLE, encode_single(context, false)),
            Format::Multi => inject_multi(context, setter, carrier),
        }
    }
}

/// Primary format plus an optional second one written alongside it, useful
/// while migrating consumers from one encoding to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FormatSet {
    primary: Format,
    secondary: Option<Format>,
}

impl FormatSet {
    const fn of(primary: Format) -> FormatSet {
        FormatSet {
            primary,
            secondary: None,
        }
    }

    fn formats(self) -> impl Iterator<Item = Format> {
        [Some(self.primary), self.secondary].into_iter().flatten()
    }
}

/// Format selection for every injection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InjectFormats {
    /// Used when the setter declares no kind.
    default: FormatSet,
    client: FormatSet,
    server: FormatSet,
    producer: FormatSet,
    consumer: FormatSet,
}

impl InjectFormats {
    const DEFAULT: InjectFormats = InjectFormats {
        default: FormatSet::of(Format::Multi),
        client: FormatSet::of(Format::Multi),
        server: FormatSet::of(Format::Multi),
        producer: FormatSet::of(Format::SingleNoParent),
        consumer: FormatSet::of(Format::SingleNoParent),
    };

    fn for_kind(&self, kind: Kind) -> FormatSet {
        match kind {
            Kind::Client => self.client,
            Kind::Server => self.server,
            Kind::Producer => self.producer,
            Kind::Consumer => self.consumer,
        }
    }

    fn slots(&self) -> [FormatSet; 5] {
        [
            self.default,
            self.client,
            self.server,
            self.producer,
            self.consumer,
        ]
    }
}

/// Implements B3 propagation: encodes and decodes trace identifiers over a
/// textual carrier.
///
/// The default configuration injects `X-B3-*` headers for RPC kinds and the
/// compact `b3` header (without parent) for messaging kinds. Use
/// [`B3Propagation::builder`] to change formats per kind; conflicting
/// configurations are rejected when the builder is finished, before any
/// request is processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct B3Propagation {
    inject: InjectFormats,
    keys: Vec<&'static str>,
}

impl Default for B3Propagation {
    fn default() -> Self {
        let inject = InjectFormats::DEFAULT;
        B3Propagation {
            keys: keys_for(&inject),
            inject,
        }
    }
}

impl B3Propagation {
    /// Returns the shared default-configuration instance.
    pub fn get() -> &'static B3Propagation {
        static DEFAULT: Lazy<B3Propagation> = Lazy::new(B3Propagation::default);
        &DEFAULT
    }

    /// Starts building a propagation with non-default injection formats.
    pub fn builder() -> B3PropagationBuilder {
        B3PropagationBuilder::default()
    }

    /// The carrier field names this configuration can read or write, for
    /// allow-listing and logging. The `b3` field sorts first when present.
    pub fn keys(&self) -> &[&'static str] {
        &self.keys
    }

    /// Binds a kind-agnostic setter, selecting the default format set.
    pub fn injector<S>(&self, setter: S) -> Injector<S> {
        Injector {
            formats: self.inject.default,
            setter,
        }
    }

    /// Binds a [`RemoteSetter`], resolving the format set for its kind now
    /// so no per-request dispatch is needed.
    pub fn remote_injector<S: RemoteSetter>(&self, setter: S) -> Injector<S> {
        Injector {
            formats: self.inject.for_kind(setter.kind()),
            setter,
        }
    }

    /// Binds a getter for extraction.
    pub fn extractor<G>(&self, getter: G) -> Extractor<G> {
        Extractor { getter }
    }
}

fn keys_for(inject: &InjectFormats) -> Vec<&'static str> {
    let mut keys = Vec::with_capacity(6);
    let slots = inject.slots();
    if slots
        .iter()
        .any(|set| set.formats().any(Format::writes_single_header))
    {
        keys.push(B3_SINGLE);
    }
    if slots
        .iter()
        .any(|set| set.formats().any(|format| format == Format::Multi))
    {
        keys.extend(MULTI_KEYS);
    }
    keys
}

/// Builds a [`B3Propagation`], validating the format table once.
#[derive(Clone, Copy, Debug, Default)]
pub struct B3PropagationBuilder {
    default: Option<(Format, Option<Format>)>,
    client: Option<(Format, Option<Format>)>,
    server: Option<(Format, Option<Format>)>,
    producer: Option<(Format, Option<Format>)>,
    consumer: Option<(Format, Option<Format>)>,
}

impl B3PropagationBuilder {
    /// Sets the format used when the setter declares no kind.
    pub fn inject_format(mut self, format: Format) -> Self {
        self.default = Some((format, None));
        self
    }

    /// Sets the format used for one kind.
    pub fn inject_kind_format(mut self, kind: Kind, format: Format) -> Self {
        *self.slot(kind) = Some((format, None));
        self
    }

    /// Sets two formats written together for one kind, for migrations.
    pub fn inject_kind_formats(mut self, kind: Kind, primary: Format, secondary: Format) -> Self {
        *self.slot(kind) = Some((primary, Some(secondary)));
        self
    }

    fn slot(&mut self, kind: Kind) -> &mut Option<(Format, Option<Format>)> {
        match kind {
            Kind::Client => &mut self.client,
            Kind::Server => &mut self.server,
            Kind::Producer => &mut self.producer,
            Kind::Consumer => &mut self.consumer,
        }
    }

    /// Validates the configuration and builds the propagation.
    pub fn build(self) -> Result<B3Propagation, B3ConfigError> {
        let defaults = InjectFormats::DEFAULT;
        let inject = InjectFormats {
            default: resolve("default", self.default, defaults.default)?,
            client: resolve("CLIENT", self.client, defaults.client)?,
            server: resolve("SERVER", self.server, defaults.server)?,
            producer: resolve("PRODUCER", self.producer, defaults.producer)?,
            consumer: resolve("CONSUMER", self.consumer, defaults.consumer)?,
        };
        Ok(B3Propagation {
            keys: keys_for(&inject),
            inject,
        })
    }
}

fn resolve(
    slot: &'static str,
    configured: Option<(Format, Option<Format>)>,
    default: FormatSet,
) -> Result<FormatSet, B3ConfigError> {
    let (primary, secondary) = match configured {
        Some(pair) => pair,
        None => return Ok(default),
    };
    if let Some(secondary) = secondary {
        if primary == secondary {
            return Err(B3ConfigError::DuplicateFormat {
                slot,
                format: primary,
            });
        }
        if primary.writes_single_header() && secondary.writes_single_header() {
            return Err(B3ConfigError::ConflictingSingleFormats { slot });
        }
    }
    Ok(FormatSet { primary, secondary })
}

/// Invalid injection-format configuration, reported by
/// [`B3PropagationBuilder::build`] before any request is processed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum B3ConfigError {
    /// The same format was listed twice for one slot.
    #[error("inject format {format:?} was configured twice for the {slot} slot")]
    DuplicateFormat {
        /// The kind (or `default`) whose configuration repeated a format.
        slot: &'static str,
        /// The repeated format.
        format: Format,
    },
    /// `Single` and `SingleNoParent` both write the `b3` field; the second
    /// would silently overwrite the first.
    #[error("Single and SingleNoParent both write the b3 field; configure only one for the {slot} slot")]
    ConflictingSingleFormats {
        /// The kind (or `default`) with both single-header formats.
        slot: &'static str,
    },
}

/// Writes a bound format set through a [`Setter`]. Immutable and safe to
/// share across threads.
#[derive(Clone)]
pub struct Injector<S> {
    formats: FormatSet,
    setter: S,
}

impl<S> Injector<S> {
    /// Encodes `context` onto `carrier` in every configured format.
    pub fn inject<C>(&self, context: &TraceContext, carrier: &mut C)
    where
        S: Setter<C>,
    {
        for format in self.formats.formats() {
            format.inject(context, &self.setter, carrier);
        }
    }
}

impl<S> fmt::Debug for Injector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("formats", &self.formats)
            .finish_non_exhaustive()
    }
}

/// Reads B3 fields through a [`Getter`]. Immutable and safe to share across
/// threads.
#[derive(Clone)]
pub struct Extractor<G> {
    getter: G,
}

impl<G> Extractor<G> {
    /// Decodes trace identifiers from `carrier`.
    ///
    /// The single `b3` field wins when readable; otherwise the `X-B3-*`
    /// fields are consulted. Malformed input yields [`Extraction::EMPTY`]
    /// (or a flags-only result when only the parent id was corrupt), never
    /// an error.
    pub fn extract<C>(&self, carrier: &C) -> Extraction
    where
        G: Getter<C>,
    {
        if let Some(value) = self.getter.get(carrier, B3_SINGLE) {
            if let Some(extraction) = parse_single(value) {
                return extraction;
            }
            // unreadable b3 falls through to the multi headers
        }
        parse_multi(&self.getter, carrier)
    }
}

impl<G> fmt::Debug for Extractor<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor").finish_non_exhaustive()
    }
}

fn encode_single(context: &TraceContext, write_parent: bool) -> String {
    let mut value = String::with_capacity(68);
    value.push_str(&context.trace_id_string());
    value.push('-');
    value.push_str(&format!("{:016x}", context.span_id()));
    let flag = if context.is_debug() {
        Some('d')
    } else {
        match context.sampled() {
            Some(true) => Some('1'),
            Some(false) => Some('0'),
            None => None,
        }
    };
    if let Some(flag) = flag {
        value.push('-');
        value.push(flag);
    }
    if write_parent {
        if let Some(parent_id) = context.parent_id() {
            value.push('-');
            value.push_str(&format!("{:016x}", parent_id));
        }
    }
    value
}

fn inject_multi<C, S: Setter<C>>(context: &TraceContext, setter: &S, carrier: &mut C) {
    setter.put(carrier, TRACE_ID, context.trace_id_string());
    setter.put(carrier, SPAN_ID, format!("{:016x}", context.span_id()));
    if let Some(parent_id) = context.parent_id() {
        setter.put(carrier, PARENT_SPAN_ID, format!("{:016x}", parent_id));
    }
    if context.is_debug() {
        setter.put(carrier, FLAGS, "1".to_string());
    } else if let Some(sampled) = context.sampled() {
        let value = if sampled { "1" } else { "0" };
        setter.put(carrier, SAMPLED, value.to_string());
    }
}

/// Parses the single `b3` field. `None` means the value was unreadable and
/// extraction should fall through to the multi headers.
fn parse_single(value: &str) -> Option<Extraction> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() == 1 {
        // sampling decision without identifiers, e.g. `b3: 0`
        let flags = parse_single_flag(parts[0])?;
        return Some(Extraction::Flags(flags));
    }
    if parts.len() > 4 {
        return None;
    }

    let (trace_id_high, trace_id) = parse_trace_id(parts[0])?;
    if trace_id_high == 0 && trace_id == 0 {
        debug!("invalid b3: trace id was all zeros");
        return None;
    }
    let span_id = parse_span_id(parts[1])?;
    if span_id == 0 {
        debug!("invalid b3: span id was all zeros");
        return None;
    }

    let mut flags = SamplingFlags::EMPTY;
    let mut parent_part = None;
    match parts.len() {
        3 if parts[2].len() == 16 => parent_part = Some(parts[2]),
        3 => flags = parse_single_flag(parts[2])?,
        4 => {
            flags = parse_single_flag(parts[2])?;
            parent_part = Some(parts[3]);
        }
        _ => {}
    }

    let mut builder = TraceContext::builder()
        .trace_id_high(trace_id_high)
        .trace_id(trace_id)
        .span_id(span_id)
        .debug(flags.is_debug());
    if !flags.is_debug() {
        if let Some(sampled) = flags.sampled() {
            builder = builder.sampled(sampled);
        }
    }
    if let Some(part) = parent_part {
        match parse_span_id(part).filter(|id| *id != 0) {
            Some(parent_id) => builder = builder.parent_id(parent_id),
            None => {
                // a corrupt parent id means the carrier's structure cannot be
                // trusted; keep only the sampling decision
                debug!(value = part, "invalid b3: unreadable parent id");
                return Some(Extraction::Flags(flags));
            }
        }
    }

    match builder.build() {
        Ok(context) => Some(Extraction::Context(context)),
        Err(error) => {
            debug!(%error, "invalid b3");
            None
        }
    }
}

fn parse_multi<C, G: Getter<C>>(getter: &G, carrier: &C) -> Extraction {
    let debug_flag = matches!(getter.get(carrier, FLAGS), Some("1"));
    let sampled = match getter.get(carrier, SAMPLED) {
        None => None,
        Some(value) => match parse_sampled(value) {
            Some(sampled) => Some(sampled),
            None => {
                debug!(value, "invalid input: expected 0 or 1 for X-B3-Sampled");
                return Extraction::EMPTY;
            }
        },
    };
    let flags = SamplingFlags::from_parts(sampled, debug_flag);

    let (trace_id_value, span_id_value) =
        match (getter.get(carrier, TRACE_ID), getter.get(carrier, SPAN_ID)) {
            (None, None) => return Extraction::Flags(flags),
            (Some(trace_id), Some(span_id)) => (trace_id, span_id),
            _ => {
                debug!("invalid input: X-B3-TraceId and X-B3-SpanId must both be present");
                return Extraction::EMPTY;
            }
        };

    let (trace_id_high, trace_id) = match parse_trace_id(trace_id_value) {
        Some(id) => id,
        None => {
            debug!(value = trace_id_value, "invalid input: unreadable X-B3-TraceId");
            return Extraction::EMPTY;
        }
    };
    if trace_id_high == 0 && trace_id == 0 {
        debug!("invalid input: trace id was all zeros");
        return Extraction::EMPTY;
    }
    let span_id = match parse_span_id(span_id_value) {
        Some(id) => id,
        None => {
            debug!(value = span_id_value, "invalid input: unreadable X-B3-SpanId");
            return Extraction::EMPTY;
        }
    };
    if span_id == 0 {
        debug!("invalid input: span id was all zeros");
        return Extraction::EMPTY;
    }

    let mut builder = TraceContext::builder()
        .trace_id_high(trace_id_high)
        .trace_id(trace_id)
        .span_id(span_id)
        .debug(flags.is_debug());
    if !flags.is_debug() {
        if let Some(sampled) = flags.sampled() {
            builder = builder.sampled(sampled);
        }
    }
    if let Some(value) = getter.get(carrier, PARENT_SPAN_ID) {
        match parse_span_id(value).filter(|id| *id != 0) {
            Some(parent_id) => builder = builder.parent_id(parent_id),
            None => {
                debug!(value, "invalid input: unreadable X-B3-ParentSpanId");
                return Extraction::Flags(flags);
            }
        }
    }

    match builder.build() {
        Ok(context) => Extraction::Context(context),
        Err(error) => {
            debug!(%error, "invalid input");
            Extraction::EMPTY
        }
    }
}

fn parse_single_flag(value: &str) -> Option<SamplingFlags> {
    match value {
        "1" => Some(SamplingFlags::SAMPLED),
        "0" => Some(SamplingFlags::NOT_SAMPLED),
        "d" => Some(SamplingFlags::DEBUG),
        _ => None,
    }
}

/// `true`/`false` are accepted for interop with older clients.
fn parse_sampled(value: &str) -> Option<bool> {
    match value {
        "1" => Some(true),
        "0" => Some(false),
        _ if value.eq_ignore_ascii_case("true") => Some(true),
        _ if value.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Fixed-width lowercase hex: 16 chars, or 32 split into high and low words.
fn parse_trace_id(value: &str) -> Option<(u64, u64)> {
    match value.len() {
        16 => Some((0, parse_lower_hex(value)?)),
        32 => {
            let (high, low) = value.split_at(16);
            Some((parse_lower_hex(high)?, parse_lower_hex(low)?))
        }
        _ => None,
    }
}

fn parse_span_id(value: &str) -> Option<u64> {
    if value.len() != 16 {
        return None;
    }
    parse_lower_hex(value)
}

fn parse_lower_hex(value: &str) -> Option<u64> {
    if !value
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    u64::from_str_radix(value, 16).ok()
}
