//! Storage: the modeled edge between two graph endpoints.
//!
//! Holds information about intermediate storage in the stream graph: which
//! actors or boundary tokens read and write it, its resolved element type,
//! and any seeded items carried over from a previous configuration's drain.
//! Rate information lives on the connected actors' ports and is only valid
//! on an untransformed graph; actor removal can introduce ambiguity.

use crate::types::{ActorId, ElementType, Endpoint, Item, StorageId, Token};

/// The edge abstraction between two actor endpoints, or between an actor
/// and a boundary [`Token`].
///
/// Upstream and downstream are ordered, non-empty endpoint lists; graphs
/// built through [`StreamGraphBuilder`](crate::graph::StreamGraphBuilder)
/// always produce exactly one endpoint on each side (splitters and joiners
/// are actors with multiple ports, not multi-endpoint storages).
#[derive(Clone, Debug)]
pub struct Storage {
    id: StorageId,
    upstream: Vec<Endpoint>,
    downstream: Vec<Endpoint>,
    element_type: ElementType,
    initial_items: Vec<Item>,
}

impl Storage {
    pub(crate) fn new(id: StorageId, upstream: Endpoint, downstream: Endpoint) -> Self {
        Self {
            id,
            upstream: vec![upstream],
            downstream: vec![downstream],
            element_type: ElementType::Any,
            initial_items: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> StorageId {
        self.id
    }

    #[must_use]
    pub fn upstream(&self) -> &[Endpoint] {
        &self.upstream
    }

    #[must_use]
    pub fn downstream(&self) -> &[Endpoint] {
        &self.downstream
    }

    /// The single upstream actor, if the producer is an actor.
    #[must_use]
    pub fn upstream_actor(&self) -> Option<ActorId> {
        match self.upstream.as_slice() {
            [single] => single.actor(),
            _ => None,
        }
    }

    /// The single downstream actor, if the consumer is an actor.
    #[must_use]
    pub fn downstream_actor(&self) -> Option<ActorId> {
        match self.downstream.as_slice() {
            [single] => single.actor(),
            _ => None,
        }
    }

    /// The upstream boundary token, if the producer is a boundary.
    #[must_use]
    pub fn upstream_token(&self) -> Option<Token> {
        match self.upstream.as_slice() {
            [single] => single.token(),
            _ => None,
        }
    }

    /// The downstream boundary token, if the consumer is a boundary.
    #[must_use]
    pub fn downstream_token(&self) -> Option<Token> {
        match self.downstream.as_slice() {
            [single] => single.token(),
            _ => None,
        }
    }

    /// Returns `true` if either end of this storage is a graph boundary.
    #[must_use]
    pub fn touches_boundary(&self) -> bool {
        self.upstream.iter().chain(&self.downstream).any(Endpoint::is_boundary)
    }

    /// The stable token addressing this edge.
    ///
    /// Boundary edges reuse their boundary token; interior edges are
    /// addressed by their (upstream, downstream) actor pair. Interior edges
    /// with ambiguous endpoints (post-transformation) have no token.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        if let Some(t) = self.upstream_token().or_else(|| self.downstream_token()) {
            return Some(t);
        }
        match (self.upstream_actor(), self.downstream_actor()) {
            (Some(u), Some(d)) => Some(Token::Between(u, d)),
            _ => None,
        }
    }

    /// The resolved element type stored in this storage.
    ///
    /// Initially [`ElementType::Any`]; the unboxing pass may narrow it to a
    /// primitive type after examining the connected actors.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub(crate) fn set_element_type(&mut self, ty: ElementType) {
        self.element_type = ty;
    }

    /// Items seeded into this storage before execution starts (drain data
    /// carried over from a previous configuration).
    #[must_use]
    pub fn initial_items(&self) -> &[Item] {
        &self.initial_items
    }

    /// Returns `true` if this storage carries seeded items.
    ///
    /// Fusion across an initial-data-bearing edge is unsound and the fusion
    /// engine checks this as an explicit precondition.
    #[must_use]
    pub fn has_initial_items(&self) -> bool {
        !self.initial_items.is_empty()
    }

    pub(crate) fn seed(&mut self, items: Vec<Item>) {
        self.initial_items = items;
    }
}
