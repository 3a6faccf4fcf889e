//! Graph construction and validation.
//!
//! [`StreamGraphBuilder`] ingests actor declarations and port-level
//! connections, validates them, and produces an immutable [`StreamGraph`]
//! ready for compilation. Construction-time mistakes (dangling ports,
//! double connections, duplicate boundary tokens) surface as [`GraphError`]
//! values rather than panics, so a tuning loop feeding bad topologies gets
//! a rejectable error instead of a crash.
//!
//! # Examples
//!
//! ```rust
//! use streamfuse::graph::{ActorDecl, StreamGraphBuilder};
//! use streamfuse::rate::{InputRate, Rate};
//! use streamfuse::types::Token;
//!
//! // Start -> lowpass -> decimate -> End
//! let mut b = StreamGraphBuilder::new();
//! let lowpass = b.add_actor(ActorDecl::filter(
//!     "lowpass",
//!     InputRate::popping(1),
//!     Rate::fixed(1),
//! ));
//! let decimate = b.add_actor(ActorDecl::filter(
//!     "decimate",
//!     InputRate::popping(2),
//!     Rate::fixed(1),
//! ));
//! b.connect_input(Token::OverallInput, (lowpass, 0)).unwrap();
//! b.connect((lowpass, 0), (decimate, 0)).unwrap();
//! b.connect_output((decimate, 0), Token::OverallOutput).unwrap();
//! let graph = b.build().unwrap();
//! assert_eq!(graph.actors().len(), 2);
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::graph::actor::{Actor, ActorDecl, InputPort, OutputPort};
use crate::graph::groups::GroupArena;
use crate::graph::storage::Storage;
use crate::types::{ActorId, ElementType, Endpoint, Item, StorageId, Token};

/// Errors raised while building or querying a stream graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("unknown actor {actor}")]
    #[diagnostic(code(streamfuse::graph::unknown_actor))]
    UnknownActor { actor: ActorId },

    #[error("actor {actor} has no {direction} port {port}")]
    #[diagnostic(code(streamfuse::graph::unknown_port))]
    UnknownPort {
        actor: ActorId,
        port: usize,
        direction: &'static str,
    },

    #[error("{direction} port {port} of actor {actor} is already connected")]
    #[diagnostic(
        code(streamfuse::graph::port_connected),
        help("each port connects to exactly one storage; fan-out needs a splitter actor")
    )]
    PortAlreadyConnected {
        actor: ActorId,
        port: usize,
        direction: &'static str,
    },

    #[error("boundary token {token} is already connected")]
    #[diagnostic(code(streamfuse::graph::boundary_connected))]
    BoundaryAlreadyConnected { token: Token },

    #[error("actors {upstream} and {downstream} are already connected")]
    #[diagnostic(
        code(streamfuse::graph::parallel_edge),
        help("parallel edges would share one addressing token; route the second connection through an intermediate actor")
    )]
    ParallelEdge {
        upstream: ActorId,
        downstream: ActorId,
    },

    #[error("{direction} port {port} of actor {actor} was never connected")]
    #[diagnostic(code(streamfuse::graph::dangling_port))]
    DanglingPort {
        actor: ActorId,
        port: usize,
        direction: &'static str,
    },

    #[error("graph has no actors")]
    #[diagnostic(code(streamfuse::graph::empty))]
    Empty,

    #[error("unknown storage {storage}")]
    #[diagnostic(code(streamfuse::graph::unknown_storage))]
    UnknownStorage { storage: StorageId },
}

/// An immutable, validated stream graph.
///
/// Actor and storage identities never change after `build()`; the mutable
/// fusion partition lives in a separate [`GroupArena`].
#[derive(Clone, Debug)]
pub struct StreamGraph {
    actors: Vec<Actor>,
    storages: Vec<Storage>,
}

impl StreamGraph {
    #[must_use]
    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    #[must_use]
    pub fn storages(&self) -> &[Storage] {
        &self.storages
    }

    pub fn actor(&self, id: ActorId) -> Result<&Actor, GraphError> {
        self.actors
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownActor { actor: id })
    }

    pub fn storage(&self, id: StorageId) -> Result<&Storage, GraphError> {
        self.storages
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownStorage { storage: id })
    }

    pub(crate) fn storage_mut(&mut self, id: StorageId) -> Result<&mut Storage, GraphError> {
        self.storages
            .get_mut(id.0 as usize)
            .ok_or(GraphError::UnknownStorage { storage: id })
    }

    /// The fixed push rate onto `storage`, if its producer is an actor with
    /// a fixed rate on that port.
    #[must_use]
    pub fn push_rate(&self, storage: &Storage) -> Option<u64> {
        let actor = self.actors.get(storage.upstream_actor()?.0 as usize)?;
        actor.output_on(storage.id())?.rate.as_fixed()
    }

    /// The fixed pop rate from `storage`, if its consumer is an actor with
    /// a fixed rate on that port.
    #[must_use]
    pub fn pop_rate(&self, storage: &Storage) -> Option<u64> {
        let actor = self.actors.get(storage.downstream_actor()?.0 as usize)?;
        actor.input_on(storage.id())?.rate.pop.as_fixed()
    }

    /// The fixed peek rate (total examined window) from `storage`.
    #[must_use]
    pub fn peek_rate(&self, storage: &Storage) -> Option<u64> {
        let actor = self.actors.get(storage.downstream_actor()?.0 as usize)?;
        actor.input_on(storage.id())?.rate.peek.as_fixed()
    }

    /// A storage is internal iff its single producer and single consumer
    /// are actors in the same group. Internal storages never need an
    /// allocated buffer; they are scratch space local to a fused unit.
    #[must_use]
    pub fn is_internal(&self, storage: &Storage, groups: &GroupArena) -> bool {
        match (storage.upstream_actor(), storage.downstream_actor()) {
            (Some(u), Some(d)) => groups.group_of(u) == groups.group_of(d),
            _ => false,
        }
    }

    /// The common element type of the actors connected to `storage`:
    /// a single agreed type, or [`ElementType::Any`] when they disagree.
    #[must_use]
    pub fn common_type(&self, storage: &Storage) -> ElementType {
        let mut types = Vec::new();
        if let Some(u) = storage.upstream_actor() {
            if let Ok(a) = self.actor(u) {
                types.push(a.output_type());
            }
        }
        if let Some(d) = storage.downstream_actor() {
            if let Ok(a) = self.actor(d) {
                types.push(a.input_type());
            }
        }
        match types.as_slice() {
            [only] => *only,
            [a, b] if a == b => *a,
            _ => ElementType::Any,
        }
    }

    /// Narrows each storage's element type to a primitive representation
    /// when the common type is primitive and every connected actor supports
    /// unboxing. Runs once during compilation.
    pub(crate) fn unbox(&mut self) {
        for idx in 0..self.storages.len() {
            let storage = &self.storages[idx];
            let common = self.common_type(storage);
            if !common.is_primitive() {
                continue;
            }
            let endpoints_unboxable = storage
                .upstream()
                .iter()
                .chain(storage.downstream())
                .filter_map(Endpoint::actor)
                .all(|id| self.actor(id).map(Actor::unboxable).unwrap_or(false));
            if endpoints_unboxable {
                self.storages[idx].set_element_type(common);
            }
        }
    }
}

enum PortSlot {
    Open,
    Taken(StorageId),
}

/// Fluent construction of a [`StreamGraph`].
pub struct StreamGraphBuilder {
    decls: Vec<ActorDecl>,
    input_slots: Vec<Vec<PortSlot>>,
    output_slots: Vec<Vec<PortSlot>>,
    storages: Vec<Storage>,
    boundaries: FxHashMap<Token, StorageId>,
}

impl Default for StreamGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamGraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decls: Vec::new(),
            input_slots: Vec::new(),
            output_slots: Vec::new(),
            storages: Vec::new(),
            boundaries: FxHashMap::default(),
        }
    }

    /// Register an actor and return its id.
    pub fn add_actor(&mut self, decl: ActorDecl) -> ActorId {
        let id = ActorId(self.decls.len() as u32);
        self.input_slots
            .push(decl.inputs.iter().map(|_| PortSlot::Open).collect());
        self.output_slots
            .push(decl.outputs.iter().map(|_| PortSlot::Open).collect());
        self.decls.push(decl);
        id
    }

    /// Connect an output port to an input port, creating the storage
    /// between them.
    pub fn connect(
        &mut self,
        from: (ActorId, usize),
        to: (ActorId, usize),
    ) -> Result<StorageId, GraphError> {
        self.check_port(from, "output")?;
        self.check_port(to, "input")?;
        // Interior edges are addressed by their actor pair; a second edge
        // between the same pair would collide with the first everywhere
        // tokens key buffers or drain data.
        if self
            .storages
            .iter()
            .any(|s| s.upstream_actor() == Some(from.0) && s.downstream_actor() == Some(to.0))
        {
            return Err(GraphError::ParallelEdge {
                upstream: from.0,
                downstream: to.0,
            });
        }
        let sid = self.new_storage(Endpoint::Actor(from.0), Endpoint::Actor(to.0));
        self.output_slots[from.0.0 as usize][from.1] = PortSlot::Taken(sid);
        self.input_slots[to.0.0 as usize][to.1] = PortSlot::Taken(sid);
        Ok(sid)
    }

    /// Connect a boundary token to an actor input port (graph input).
    pub fn connect_input(
        &mut self,
        token: Token,
        to: (ActorId, usize),
    ) -> Result<StorageId, GraphError> {
        self.check_boundary(token)?;
        self.check_port(to, "input")?;
        let sid = self.new_storage(Endpoint::Boundary(token), Endpoint::Actor(to.0));
        self.input_slots[to.0.0 as usize][to.1] = PortSlot::Taken(sid);
        self.boundaries.insert(token, sid);
        Ok(sid)
    }

    /// Connect an actor output port to a boundary token (graph output).
    pub fn connect_output(
        &mut self,
        from: (ActorId, usize),
        token: Token,
    ) -> Result<StorageId, GraphError> {
        self.check_boundary(token)?;
        self.check_port(from, "output")?;
        let sid = self.new_storage(Endpoint::Actor(from.0), Endpoint::Boundary(token));
        self.output_slots[from.0.0 as usize][from.1] = PortSlot::Taken(sid);
        self.boundaries.insert(token, sid);
        Ok(sid)
    }

    /// Seed a storage with items carried over from a previous
    /// configuration's drain. Seeded edges are excluded from fusion.
    pub fn seed(&mut self, storage: StorageId, items: Vec<Item>) -> Result<(), GraphError> {
        self.storages
            .get_mut(storage.0 as usize)
            .ok_or(GraphError::UnknownStorage { storage })?
            .seed(items);
        Ok(())
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<StreamGraph, GraphError> {
        if self.decls.is_empty() {
            return Err(GraphError::Empty);
        }
        let mut actors = Vec::with_capacity(self.decls.len());
        for (idx, decl) in self.decls.iter().enumerate() {
            let id = ActorId(idx as u32);
            let inputs = Self::take_ports(&self.input_slots[idx], &decl.inputs, id, "input")?
                .into_iter()
                .zip(&decl.inputs)
                .map(|(storage, rate)| InputPort {
                    rate: *rate,
                    storage,
                })
                .collect();
            let outputs = Self::take_ports_out(&self.output_slots[idx], &decl.outputs, id)?
                .into_iter()
                .zip(&decl.outputs)
                .map(|(storage, rate)| OutputPort {
                    rate: *rate,
                    storage,
                })
                .collect();
            actors.push(Actor::new(id, decl, inputs, outputs));
        }
        debug!(
            actors = actors.len(),
            storages = self.storages.len(),
            "stream graph built"
        );
        Ok(StreamGraph {
            actors,
            storages: self.storages,
        })
    }

    fn take_ports(
        slots: &[PortSlot],
        rates: &[crate::rate::InputRate],
        actor: ActorId,
        direction: &'static str,
    ) -> Result<Vec<StorageId>, GraphError> {
        debug_assert_eq!(slots.len(), rates.len());
        slots
            .iter()
            .enumerate()
            .map(|(port, slot)| match slot {
                PortSlot::Taken(sid) => Ok(*sid),
                PortSlot::Open => Err(GraphError::DanglingPort {
                    actor,
                    port,
                    direction,
                }),
            })
            .collect()
    }

    fn take_ports_out(
        slots: &[PortSlot],
        rates: &[crate::rate::Rate],
        actor: ActorId,
    ) -> Result<Vec<StorageId>, GraphError> {
        debug_assert_eq!(slots.len(), rates.len());
        slots
            .iter()
            .enumerate()
            .map(|(port, slot)| match slot {
                PortSlot::Taken(sid) => Ok(*sid),
                PortSlot::Open => Err(GraphError::DanglingPort {
                    actor,
                    port,
                    direction: "output",
                }),
            })
            .collect()
    }

    fn new_storage(&mut self, upstream: Endpoint, downstream: Endpoint) -> StorageId {
        let sid = StorageId(self.storages.len() as u32);
        self.storages.push(Storage::new(sid, upstream, downstream));
        sid
    }

    fn check_boundary(&self, token: Token) -> Result<(), GraphError> {
        if self.boundaries.contains_key(&token) {
            return Err(GraphError::BoundaryAlreadyConnected { token });
        }
        Ok(())
    }

    fn check_port(
        &self,
        (actor, port): (ActorId, usize),
        direction: &'static str,
    ) -> Result<(), GraphError> {
        let slots = match direction {
            "input" => &self.input_slots,
            _ => &self.output_slots,
        };
        let actor_slots = slots
            .get(actor.0 as usize)
            .ok_or(GraphError::UnknownActor { actor })?;
        match actor_slots.get(port) {
            None => Err(GraphError::UnknownPort {
                actor,
                port,
                direction,
            }),
            Some(PortSlot::Taken(_)) => Err(GraphError::PortAlreadyConnected {
                actor,
                port,
                direction,
            }),
            Some(PortSlot::Open) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::InputRate;
    use crate::rate::Rate;

    fn two_port_pair(b: &mut StreamGraphBuilder) -> (ActorId, ActorId) {
        let fork = b.add_actor(
            ActorDecl::new("fork")
                .input(InputRate::popping(2))
                .output(Rate::fixed(1))
                .output(Rate::fixed(1)),
        );
        let merge = b.add_actor(
            ActorDecl::new("merge")
                .input(InputRate::popping(1))
                .input(InputRate::popping(1))
                .output(Rate::fixed(2)),
        );
        (fork, merge)
    }

    #[test]
    fn second_edge_between_the_same_actors_is_rejected() {
        let mut b = StreamGraphBuilder::new();
        let (fork, merge) = two_port_pair(&mut b);
        b.connect((fork, 0), (merge, 0)).unwrap();
        // Both ports are free, but the pair already shares an edge.
        let err = b.connect((fork, 1), (merge, 1)).unwrap_err();
        assert!(matches!(
            err,
            GraphError::ParallelEdge { upstream, downstream }
                if upstream == fork && downstream == merge
        ));
    }

    #[test]
    fn distinct_pairs_still_connect_freely() {
        let mut b = StreamGraphBuilder::new();
        let (fork, merge) = two_port_pair(&mut b);
        let via = b.add_actor(ActorDecl::filter(
            "via",
            InputRate::popping(1),
            Rate::fixed(1),
        ));
        b.connect_input(Token::OverallInput, (fork, 0)).unwrap();
        b.connect((fork, 0), (merge, 0)).unwrap();
        b.connect((fork, 1), (via, 0)).unwrap();
        b.connect((via, 0), (merge, 1)).unwrap();
        b.connect_output((merge, 0), Token::OverallOutput).unwrap();
        let graph = b.build().unwrap();
        assert_eq!(graph.storages().len(), 5);
    }
}
