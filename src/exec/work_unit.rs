//! The opaque compiled-unit contract.
//!
//! A [`WorkUnit`] is one executable fused group: the coordinator installs
//! its boundary buffers, asks for per-core runnables, and later drains it.
//! How the unit turns group schedules into firing code is its own business
//! (a codegen backend, an interpreter, a scripted test double); the
//! coordinator only sees this trait.
//!
//! [`DrainData`] is the portable residue of a drained unit: leftover items
//! keyed by [`Token`] plus opaque per-actor state, serializable so a
//! reconfiguration can seed it into the next compiled plan.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::buffers::{BufferError, ConcreteStorage};
use crate::compile::CompiledPlan;
use crate::types::{ActorId, GroupId, Item, Token};

/// Failure inside a work unit.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkUnitError {
    #[error("work unit for group {group} has no buffer installed for token {token}")]
    #[diagnostic(
        code(streamfuse::exec::missing_buffer),
        help("install_buffers must cover every token the unit touches")
    )]
    MissingBuffer { group: GroupId, token: Token },

    #[error("work unit for group {group} has {count} cores; core {core} does not exist")]
    #[diagnostic(code(streamfuse::exec::no_such_core))]
    NoSuchCore {
        group: GroupId,
        core: usize,
        count: usize,
    },

    #[error("work unit for group {group} crashed: {reason}")]
    #[diagnostic(code(streamfuse::exec::crashed))]
    Crashed { group: GroupId, reason: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Buffer(#[from] BufferError),
}

/// How a drain disposes of in-flight data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainKind {
    /// The application is shutting down; leftover data is discarded.
    Final,
    /// A reconfiguration follows; leftover data is collected into
    /// [`DrainData`] and seeded into the next configuration.
    Intermediate,
}

/// Shared handle to one [`ConcreteStorage`] ring.
///
/// Producer and consumer sides hold clones; the mutex is held only for the
/// duration of a single push/pop/peek, never across a firing.
#[derive(Clone, Debug)]
pub struct BufferHandle {
    inner: Arc<Mutex<ConcreteStorage>>,
}

impl BufferHandle {
    #[must_use]
    pub fn new(storage: ConcreteStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    pub fn push(&self, item: Item) -> Result<(), BufferError> {
        self.inner.lock().push(item)
    }

    #[must_use]
    pub fn pop(&self) -> Option<Item> {
        self.inner.lock().pop()
    }

    #[must_use]
    pub fn peek(&self, offset: usize) -> Option<Item> {
        self.inner.lock().peek(offset)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Space left before a push would fail.
    #[must_use]
    pub fn free(&self) -> usize {
        let guard = self.inner.lock();
        guard.capacity() - guard.len()
    }

    /// Consume everything left in FIFO order.
    #[must_use]
    pub fn drain_remaining(&self) -> Vec<Item> {
        self.inner.lock().drain_remaining()
    }
}

/// Outcome of one steady-state step of a core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The core fired; more work may be available.
    Ran,
    /// Not enough input (or output space) for a firing right now.
    Idle,
}

/// One core's executable code: the priming portion, run exactly once, then
/// a steady-state step invoked in a loop until the core is stopped.
pub struct CoreCode {
    init: Box<dyn FnMut() -> Result<(), WorkUnitError> + Send>,
    steady: Box<dyn FnMut() -> Result<Step, WorkUnitError> + Send>,
}

impl CoreCode {
    pub fn new(
        init: impl FnMut() -> Result<(), WorkUnitError> + Send + 'static,
        steady: impl FnMut() -> Result<Step, WorkUnitError> + Send + 'static,
    ) -> Self {
        Self {
            init: Box::new(init),
            steady: Box::new(steady),
        }
    }

    /// Run the whole priming portion for this core.
    pub fn run_init(&mut self) -> Result<(), WorkUnitError> {
        (self.init)()
    }

    /// Attempt one steady-state firing.
    pub fn step(&mut self) -> Result<Step, WorkUnitError> {
        (self.steady)()
    }
}

impl std::fmt::Debug for CoreCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreCode").finish_non_exhaustive()
    }
}

/// An executable fused group, as the coordinator sees it.
pub trait WorkUnit: Send {
    /// The group this unit executes.
    fn group(&self) -> GroupId;

    /// Every boundary token this unit reads or writes.
    fn tokens(&self) -> BTreeSet<Token>;

    /// Install the buffers this unit fires against, keyed by token.
    /// Must cover every token in [`tokens`](Self::tokens).
    fn install_buffers(
        &mut self,
        buffers: FxHashMap<Token, BufferHandle>,
    ) -> Result<(), WorkUnitError>;

    /// Number of cores this unit wants.
    fn core_count(&self) -> usize;

    /// The runnable for one core. Requires buffers to be installed.
    fn core_code(&mut self, core: usize) -> Result<CoreCode, WorkUnitError>;

    /// Minimum ring capacity this unit needs on the given token's buffer
    /// to make progress (one full firing's worth of items).
    fn min_buffer_capacity(&self, token: Token) -> usize;

    /// Notify the unit that a drain of the given kind has begun. Called
    /// after its cores have stopped.
    fn drain(&mut self, kind: DrainKind);

    /// Collect this unit's drain residue. Meaningful only after
    /// [`drain`](Self::drain) with [`DrainKind::Intermediate`].
    fn drain_data(&mut self) -> DrainData;
}

/// Builds [`WorkUnit`]s from a compiled plan. Stands in for the codegen
/// backend, which is out of scope and consumed only through this seam.
pub trait WorkUnitFactory: Send + Sync {
    fn build(
        &self,
        plan: &CompiledPlan,
        group: GroupId,
    ) -> Result<Box<dyn WorkUnit>, WorkUnitError>;
}

/// The portable residue of a drained application or unit: leftover items
/// per token, plus opaque per-actor state blobs.
///
/// Uses ordered maps so the serialized form is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainData {
    items: BTreeMap<Token, Vec<Item>>,
    state: BTreeMap<ActorId, serde_json::Value>,
}

impl DrainData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leftover items for one token, oldest first.
    #[must_use]
    pub fn items_for(&self, token: Token) -> &[Item] {
        self.items.get(&token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append leftover items for a token (extends any existing run).
    pub fn add_items(&mut self, token: Token, items: Vec<Item>) {
        if items.is_empty() {
            return;
        }
        self.items.entry(token).or_default().extend(items);
    }

    /// Record one actor's opaque state blob.
    pub fn set_state(&mut self, actor: ActorId, state: serde_json::Value) {
        self.state.insert(actor, state);
    }

    #[must_use]
    pub fn state_of(&self, actor: ActorId) -> Option<&serde_json::Value> {
        self.state.get(&actor)
    }

    /// Absorb another unit's residue.
    pub fn merge(&mut self, other: DrainData) {
        for (token, items) in other.items {
            self.add_items(token, items);
        }
        self.state.extend(other.state);
    }

    /// The portion of this residue belonging to the given actor subset:
    /// interior tokens whose consumer is in the subset, plus state blobs of
    /// subset members. Overall input/output residue stays with the
    /// coordinator and is never split.
    #[must_use]
    pub fn split_for(&self, actors: &BTreeSet<ActorId>) -> DrainData {
        let items = self
            .items
            .iter()
            .filter(|(token, _)| match token {
                Token::Between(_, downstream) => actors.contains(downstream),
                Token::OverallInput | Token::OverallOutput => false,
            })
            .map(|(t, v)| (*t, v.clone()))
            .collect();
        let state = self
            .state
            .iter()
            .filter(|(actor, _)| actors.contains(actor))
            .map(|(a, s)| (*a, s.clone()))
            .collect();
        DrainData { items, state }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.values().all(Vec::is_empty) && self.state.is_empty()
    }

    /// Total leftover item count across all tokens.
    #[must_use]
    pub fn total_items(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    /// Tokens with at least one leftover item.
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.items
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(t, _)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;

    #[test]
    fn buffer_handle_shares_one_ring() {
        let handle = BufferHandle::new(ConcreteStorage::new(ElementType::I64, 4));
        let other = handle.clone();
        handle.push(Item::I64(1)).unwrap();
        assert_eq!(other.pop(), Some(Item::I64(1)));
        assert!(handle.is_empty());
    }

    #[test]
    fn drain_data_split_keeps_consumer_side_tokens() {
        let mut data = DrainData::new();
        data.add_items(Token::Between(ActorId(0), ActorId(1)), vec![Item::I64(5)]);
        data.add_items(Token::Between(ActorId(1), ActorId(2)), vec![Item::I64(6)]);
        data.add_items(Token::OverallInput, vec![Item::I64(7)]);
        data.set_state(ActorId(1), serde_json::json!({"seen": 3}));
        data.set_state(ActorId(2), serde_json::json!({"seen": 9}));

        let subset: BTreeSet<ActorId> = [ActorId(1)].into();
        let split = data.split_for(&subset);
        assert_eq!(
            split.items_for(Token::Between(ActorId(0), ActorId(1))),
            &[Item::I64(5)]
        );
        assert!(split.items_for(Token::Between(ActorId(1), ActorId(2))).is_empty());
        assert!(split.items_for(Token::OverallInput).is_empty());
        assert!(split.state_of(ActorId(1)).is_some());
        assert!(split.state_of(ActorId(2)).is_none());
    }

    #[test]
    fn drain_data_merge_extends_runs() {
        let token = Token::Between(ActorId(0), ActorId(1));
        let mut a = DrainData::new();
        a.add_items(token, vec![Item::I64(1)]);
        let mut b = DrainData::new();
        b.add_items(token, vec![Item::I64(2)]);
        a.merge(b);
        assert_eq!(a.items_for(token), &[Item::I64(1), Item::I64(2)]);
        assert_eq!(a.total_items(), 2);
    }
}
