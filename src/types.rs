//! Core identity types for the streamfuse compilation model.
//!
//! This module defines the fundamental types used throughout the system for
//! identifying actors, groups, machines, and boundary edges in stream graphs.
//! These are the core domain concepts that define what a stream graph *is*.
//!
//! # Key Types
//!
//! - [`ActorId`] / [`GroupId`] / [`MachineId`]: dense arena-style identifiers
//! - [`Token`]: a stable boundary-edge identifier surviving group restructuring
//! - [`Endpoint`]: either an actor or a boundary token (a storage endpoint)
//! - [`ElementType`]: the resolved element type flowing through a storage
//! - [`Item`]: one data element in flight, with unboxed primitive variants
//!
//! # Examples
//!
//! ```rust
//! use streamfuse::types::{ActorId, Endpoint, Token};
//!
//! let a = ActorId(0);
//! let input = Endpoint::Boundary(Token::OverallInput);
//! let inner = Endpoint::Actor(a);
//!
//! assert!(input.is_boundary());
//! assert_eq!(inner.actor(), Some(a));
//!
//! // Tokens encode to a stable persisted form
//! assert_eq!(Token::Between(ActorId(1), ActorId(2)).encode(), "1->2");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a single computation node in the stream graph.
///
/// Actor ids are dense integers assigned in graph-ingestion order and never
/// change afterwards; group membership is tracked by the group arena, not
/// by the actor itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u32);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Identity of an [`ActorGroup`](crate::graph::ActorGroup) in the group arena.
///
/// Group ids are stable for the lifetime of one compilation: fusing group
/// `g` into its predecessor `p` keeps `p`'s id and retires `g`'s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Identity of a [`Storage`](crate::graph::Storage) edge within one graph.
///
/// Storage ids are dense integers assigned at connection time. They are
/// compilation-local; cross-machine addressing uses [`Token`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(pub u32);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Identity of one machine in the distributed partition map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// A stable identifier for a graph-boundary edge.
///
/// Unlike storages, tokens persist across group restructuring (fusion,
/// actor removal) and are the unit of cross-machine addressing: boundary
/// channels, drain data, and buffer installation are all keyed by `Token`.
///
/// # Persistence
///
/// `Token` supports a human-readable [`encode`](Self::encode)/
/// [`decode`](Self::decode) round trip in addition to serde, for use in
/// configuration parameter names and log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Token {
    /// The overall input edge of the whole application.
    OverallInput,
    /// The overall output edge of the whole application.
    OverallOutput,
    /// An interior edge between two actors that crosses a group or machine
    /// boundary. Ordered upstream, downstream.
    Between(ActorId, ActorId),
}

impl Token {
    /// Encode a token into its persisted string form.
    ///
    /// - `OverallInput` → `"in"`
    /// - `OverallOutput` → `"out"`
    /// - `Between(a1, a2)` → `"1->2"`
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Token::OverallInput => "in".to_string(),
            Token::OverallOutput => "out".to_string(),
            Token::Between(u, d) => format!("{}->{}", u.0, d.0),
        }
    }

    /// Decode a persisted string form back into a token.
    ///
    /// Returns `None` for unrecognized input rather than guessing.
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Token::OverallInput),
            "out" => Some(Token::OverallOutput),
            _ => {
                let (u, d) = s.split_once("->")?;
                Some(Token::Between(
                    ActorId(u.parse().ok()?),
                    ActorId(d.parse().ok()?),
                ))
            }
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// One endpoint of a [`Storage`](crate::graph::Storage): either an actor in
/// the graph or a boundary token.
///
/// The original model used open class hierarchies and runtime type tests to
/// express "actor or token"; the sum type makes every endpoint match
/// exhaustive at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// An actor inside the graph.
    Actor(ActorId),
    /// A graph boundary (overall input/output or cross-machine edge).
    Boundary(Token),
}

impl Endpoint {
    /// Returns the actor id if this endpoint is an actor.
    #[must_use]
    pub fn actor(&self) -> Option<ActorId> {
        match self {
            Endpoint::Actor(id) => Some(*id),
            Endpoint::Boundary(_) => None,
        }
    }

    /// Returns the token if this endpoint is a boundary.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self {
            Endpoint::Actor(_) => None,
            Endpoint::Boundary(t) => Some(*t),
        }
    }

    /// Returns `true` if this endpoint is a graph boundary.
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        matches!(self, Endpoint::Boundary(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Actor(id) => write!(f, "{id}"),
            Endpoint::Boundary(t) => write!(f, "[{t}]"),
        }
    }
}

/// The resolved element type flowing through a storage.
///
/// Storages start as [`Any`](Self::Any) (boxed, general) and may be narrowed
/// to a primitive-equivalent representation by the unboxing pass when every
/// connected actor supports it, avoiding boxed-element overhead in the
/// allocated circular buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Boxed general elements ([`Item`]).
    Any,
    /// 64-bit signed integers.
    I64,
    /// 64-bit floats.
    F64,
    /// Booleans.
    Bool,
    /// UTF-8 strings (boxed; never unboxed, but type-checked).
    Text,
}

impl ElementType {
    /// Returns `true` if buffers of this type use an unboxed representation.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self, ElementType::I64 | ElementType::F64 | ElementType::Bool)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Any => write!(f, "any"),
            ElementType::I64 => write!(f, "i64"),
            ElementType::F64 => write!(f, "f64"),
            ElementType::Bool => write!(f, "bool"),
            ElementType::Text => write!(f, "text"),
        }
    }
}

/// One data element in flight between actors.
///
/// Items are what boundary channels serialize and what boxed buffers store.
/// Unboxed buffers store the raw primitive and re-wrap on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Item {
    I64(i64),
    F64(f64),
    Bool(bool),
    Text(String),
    /// Arbitrary structured payload for application-defined element types.
    Json(serde_json::Value),
}

impl Item {
    /// The narrowest [`ElementType`] describing this item.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        match self {
            Item::I64(_) => ElementType::I64,
            Item::F64(_) => ElementType::F64,
            Item::Bool(_) => ElementType::Bool,
            Item::Text(_) => ElementType::Text,
            Item::Json(_) => ElementType::Any,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Item::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Item::F64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Item::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Item {
    fn from(v: i64) -> Self {
        Item::I64(v)
    }
}

impl From<f64> for Item {
    fn from(v: f64) -> Self {
        Item::F64(v)
    }
}

impl From<bool> for Item {
    fn from(v: bool) -> Self {
        Item::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_encode_decode_round_trip() {
        let tokens = [
            Token::OverallInput,
            Token::OverallOutput,
            Token::Between(ActorId(3), ActorId(7)),
        ];
        for t in tokens {
            assert_eq!(Token::decode(&t.encode()), Some(t));
        }
        assert_eq!(Token::decode("garbage"), None);
        assert_eq!(Token::decode("x->y"), None);
    }

    #[test]
    fn endpoint_accessors() {
        let a = Endpoint::Actor(ActorId(1));
        let b = Endpoint::Boundary(Token::OverallOutput);
        assert_eq!(a.actor(), Some(ActorId(1)));
        assert_eq!(a.token(), None);
        assert_eq!(b.token(), Some(Token::OverallOutput));
        assert!(b.is_boundary());
        assert!(!a.is_boundary());
    }

    #[test]
    fn item_types() {
        assert_eq!(Item::from(4i64).element_type(), ElementType::I64);
        assert!(ElementType::I64.is_primitive());
        assert!(!ElementType::Text.is_primitive());
        assert_eq!(Item::from(true).as_bool(), Some(true));
    }
}
