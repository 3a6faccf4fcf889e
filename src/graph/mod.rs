//! Stream graph model: actors, storages, and fusable groups.
//!
//! This module holds the node/edge/buffer representation the compilation
//! core operates on:
//!
//! - [`Actor`]: one computation node with declared per-port rates
//! - [`Storage`]: the edge between two endpoints (actor or boundary token)
//! - [`ActorGroup`] / [`GroupArena`]: the mutable fusion partition
//! - [`StreamGraphBuilder`]: fluent construction and validation into a
//!   [`StreamGraph`]
//!
//! Actor and storage identities are immutable once built; only group
//! membership mutates during fusion, and it does so inside the arena rather
//! than through back-pointers on live objects.

mod actor;
mod builder;
mod groups;
mod storage;

pub use actor::{Actor, ActorDecl, InputPort, OutputPort};
pub use builder::{GraphError, StreamGraph, StreamGraphBuilder};
pub use groups::{ActorGroup, GroupArena};
pub use storage::Storage;
