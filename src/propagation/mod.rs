//! Carrier-agnostic reading and writing of trace identifiers.
//!
//! Propagation is parameterized over the carrier type: instrumentation
//! supplies a [`Setter`] that knows how to write one field onto its carrier
//! (HTTP headers, message properties, a plain map) and a [`Getter`] that
//! knows how to read one back. [`B3Propagation`] binds those to a concrete
//! wire format, producing immutable [`Injector`]/[`Extractor`] values that
//! are safe to share across threads.
//!
//! [`Injector`]: b3::Injector
//! [`Extractor`]: b3::Extractor

use std::collections::HashMap;
use std::fmt;

pub mod b3;

pub use b3::{B3ConfigError, B3Propagation, B3PropagationBuilder, Format};

/// The remote kind of the operation a carrier belongs to.
///
/// Injection formats can differ per kind: messaging carriers conventionally
/// receive the compact single-header form without a parent id, while RPC
/// carriers receive the multi-header form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Outbound RPC request.
    Client,
    /// Inbound RPC request.
    Server,
    /// Outbound message.
    Producer,
    /// Inbound message.
    Consumer,
}

/// Writes one propagation field onto a carrier.
///
/// Implemented for closures of the shape `Fn(&mut C, &str, String)`.
pub trait Setter<C> {
    /// Writes `value` under `key`, replacing any previous value.
    fn put(&self, carrier: &mut C, key: &str, value: String);
}

impl<C, F> Setter<C> for F
where
    F: Fn(&mut C, &str, String),
{
    fn put(&self, carrier: &mut C, key: &str, value: String) {
        self(carrier, key, value)
    }
}

/// Reads one propagation field from a carrier.
///
/// Implemented for functions of the shape
/// `for<'a> fn(&'a C, &str) -> Option<&'a str>`.
pub trait Getter<C> {
    /// Returns the value under `key`, or `None` when absent.
    fn get<'a>(&self, carrier: &'a C, key: &str) -> Option<&'a str>;
}

impl<C, F> Getter<C> for F
where
    F: for<'a> Fn(&'a C, &str) -> Option<&'a str>,
{
    fn get<'a>(&self, carrier: &'a C, key: &str) -> Option<&'a str> {
        self(carrier, key)
    }
}

/// A setter that knows the remote [`Kind`] of every carrier it writes.
///
/// Declaring the kind here lets [`B3Propagation::remote_injector`] resolve
/// the per-kind format set once, when the injector is bound, instead of
/// inspecting carriers at request time.
pub trait RemoteSetter {
    /// The kind of every carrier written through this setter.
    fn kind(&self) -> Kind;
}

/// [`Setter`] for `HashMap<String, String>` carriers, preserving key case.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapSetter;

impl<S: std::hash::BuildHasher> Setter<HashMap<String, String, S>> for MapSetter {
    fn put(&self, carrier: &mut HashMap<String, String, S>, key: &str, value: String) {
        carrier.insert(key.to_string(), value);
    }
}

/// [`Getter`] for `HashMap<String, String>` carriers.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapGetter;

impl<S: std::hash::BuildHasher> Getter<HashMap<String, String, S>> for MapGetter {
    fn get<'a>(&self, carrier: &'a HashMap<String, String, S>, key: &str) -> Option<&'a str> {
        carrier.get(key).map(String::as_str)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Client => f.write_str("CLIENT"),
            Kind::Server => f.write_str("SERVER"),
            Kind::Producer => f.write_str("PRODUCER"),
            Kind::Consumer => f.write_str("CONSUMER"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_setter_replaces() {
        let mut carrier = HashMap::new();
        MapSetter.put(&mut carrier, "b3", "0".to_string());
        MapSetter.put(&mut carrier, "b3", "1".to_string());
        assert_eq!(MapGetter.get(&carrier, "b3"), Some("1"));
    }

    #[test]
    fn map_getter_is_case_sensitive() {
        let mut carrier = HashMap::new();
        MapSetter.put(&mut carrier, "X-B3-TraceId", "0000000000000001".to_string());
        assert_eq!(MapGetter.get(&carrier, "x-b3-traceid"), None);
    }

    #[test]
    fn closure_setter() {
        let mut carrier: Vec<(String, String)> = Vec::new();
        let setter = |carrier: &mut Vec<(String, String)>, key: &str, value: String| {
            carrier.push((key.to_string(), value));
        };
        setter.put(&mut carrier, "b3", "1".to_string());
        assert_eq!(carrier, vec![("b3".to_string(), "1".to_string())]);
    }

    #[test]
    fn fn_getter() {
        fn get<'a>(carrier: &'a Vec<(String, String)>, key: &str) -> Option<&'a str> {
            carrier
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        }

        let carrier = vec![("b3".to_string(), "1".to_string())];
        assert_eq!(get.get(&carrier, "b3"), Some("1"));
        assert_eq!(get.get(&carrier, "X-B3-TraceId"), None);
    }
}
