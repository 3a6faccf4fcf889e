//! Buffer requirement computation and concrete circular storage.
//!
//! For every storage that is not internal to a fused group, the allocator
//! computes how many items one steady-state iteration moves through it,
//! the peek overhang beyond the pop count, and the transient headroom the
//! priming phase needs, then instantiates a fixed-capacity circular buffer
//! over the storage's resolved element type. Primitive element types get
//! unboxed ring representations.
//!
//! Unresolved rates at this point are a compilation-time programmer error:
//! the allocator fails loudly rather than guessing a capacity.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::graph::{GroupArena, StreamGraph};
use crate::schedule::init::InitSchedule;
use crate::schedule::solver::Schedule;
use crate::types::{ElementType, GroupId, Item, StorageId};

/// Failure sizing or using a concrete buffer.
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum BufferError {
    #[error("storage {storage} has unresolved rates; cannot size its buffer")]
    #[diagnostic(
        code(streamfuse::buffers::unresolved_rate),
        help("resolve all range rates to fixed choices before compiling")
    )]
    UnresolvedRate { storage: StorageId },

    #[error("buffer is full (capacity {capacity})")]
    #[diagnostic(code(streamfuse::buffers::full))]
    Full { capacity: usize },

    #[error("buffer holds {expected} elements but received {got}")]
    #[diagnostic(code(streamfuse::buffers::type_mismatch))]
    TypeMismatch {
        expected: ElementType,
        got: ElementType,
    },
}

/// Sizing facts for one non-internal storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageRequirements {
    /// Items moved through this storage per steady-state iteration
    /// (producer and consumer sides agree by the balance equations).
    pub items_per_iteration: u64,
    /// Maximum peek distance beyond the pop count on the consuming side,
    /// so a circular buffer never needs to wrap mid-peek.
    pub peek_overhang: u64,
    /// Headroom for items produced during priming (and seeded items) that
    /// sit in the buffer before steady-state consumption balances out.
    pub init_transient: u64,
}

impl StorageRequirements {
    /// Final buffer capacity under a safety multiplier (≥ 1).
    #[must_use]
    pub fn capacity(&self, multiplier: u64) -> usize {
        let steady = self.items_per_iteration * multiplier.max(1);
        usize::try_from(steady + self.peek_overhang + self.init_transient).unwrap_or(usize::MAX)
    }
}

/// Compute [`StorageRequirements`] for every non-internal storage.
///
/// Requires fixed rates on every connected port and a solved external
/// schedule; call after fusion and external scheduling.
pub fn compute_requirements(
    graph: &StreamGraph,
    groups: &GroupArena,
    external: &Schedule<GroupId>,
    init: &InitSchedule,
) -> Result<FxHashMap<StorageId, StorageRequirements>, BufferError> {
    let mut requirements = FxHashMap::default();
    for storage in graph.storages() {
        if graph.is_internal(storage, groups) {
            continue;
        }
        let unresolved = || BufferError::UnresolvedRate {
            storage: storage.id(),
        };

        // Steady-state items per iteration, measured on whichever side is
        // an actor (both sides agree when both are actors).
        let (items, init_writes) = if let Some(producer) = storage.upstream_actor() {
            let push = graph.push_rate(storage).ok_or_else(unresolved)?;
            let pg = groups.group_of(producer);
            let per_group_firing = push
                * groups
                    .group(pg)
                    .map(|g| g.firings_of(producer))
                    .unwrap_or(0);
            (
                per_group_firing * external.multiplicity(&pg),
                per_group_firing * init.total_init(pg),
            )
        } else if let Some(consumer) = storage.downstream_actor() {
            let pop = graph.pop_rate(storage).ok_or_else(unresolved)?;
            let cg = groups.group_of(consumer);
            let per_group_firing = pop
                * groups
                    .group(cg)
                    .map(|g| g.firings_of(consumer))
                    .unwrap_or(0);
            // Boundary-fed storage: priming pulls ahead by the consumer's
            // own init firings.
            (
                per_group_firing * external.multiplicity(&cg),
                per_group_firing * init.total_init(cg),
            )
        } else {
            // Boundary-to-boundary edges carry no schedulable rate.
            return Err(unresolved());
        };

        let peek_overhang = match storage.downstream_actor() {
            Some(_) => {
                let pop = graph.pop_rate(storage).ok_or_else(unresolved)?;
                let peek = graph.peek_rate(storage).ok_or_else(unresolved)?;
                peek.saturating_sub(pop)
            }
            None => 0,
        };

        let seeded = storage.initial_items().len() as u64;
        requirements.insert(
            storage.id(),
            StorageRequirements {
                items_per_iteration: items,
                peek_overhang,
                init_transient: init_writes + seeded,
            },
        );
    }
    debug!(buffers = requirements.len(), "storage requirements computed");
    Ok(requirements)
}

/// The realized buffer for one non-internal storage: a fixed-capacity
/// circular buffer, exclusively written by its producer and read by its
/// consumer.
///
/// Primitive element types store unboxed values and re-wrap on read.
#[derive(Debug)]
pub struct ConcreteStorage {
    element_type: ElementType,
    capacity: usize,
    head: usize,
    len: usize,
    repr: RingRepr,
}

#[derive(Debug)]
enum RingRepr {
    I64(Box<[i64]>),
    F64(Box<[f64]>),
    Bool(Box<[bool]>),
    Boxed(Box<[Option<Item>]>),
}

impl ConcreteStorage {
    /// Allocate an empty buffer of `capacity` elements of `element_type`.
    #[must_use]
    pub fn new(element_type: ElementType, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let repr = match element_type {
            ElementType::I64 => RingRepr::I64(vec![0; capacity].into_boxed_slice()),
            ElementType::F64 => RingRepr::F64(vec![0.0; capacity].into_boxed_slice()),
            ElementType::Bool => RingRepr::Bool(vec![false; capacity].into_boxed_slice()),
            ElementType::Any | ElementType::Text => {
                RingRepr::Boxed(vec![None; capacity].into_boxed_slice())
            }
        };
        Self {
            element_type,
            capacity,
            head: 0,
            len: 0,
            repr,
        }
    }

    /// Allocate from computed requirements, pre-filled with seeded items.
    pub fn for_storage(
        graph: &StreamGraph,
        storage: StorageId,
        requirements: &StorageRequirements,
        multiplier: u64,
    ) -> Result<Self, BufferError> {
        let s = graph
            .storage(storage)
            .map_err(|_| BufferError::UnresolvedRate { storage })?;
        let mut buffer = Self::new(s.element_type(), requirements.capacity(multiplier));
        for item in s.initial_items() {
            buffer.push(item.clone())?;
        }
        Ok(buffer)
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one item. Fails when full or when an unboxed buffer receives
    /// an element of the wrong type.
    pub fn push(&mut self, item: Item) -> Result<(), BufferError> {
        if self.len == self.capacity {
            return Err(BufferError::Full {
                capacity: self.capacity,
            });
        }
        let slot = (self.head + self.len) % self.capacity;
        match (&mut self.repr, &item) {
            (RingRepr::I64(ring), Item::I64(v)) => ring[slot] = *v,
            (RingRepr::F64(ring), Item::F64(v)) => ring[slot] = *v,
            (RingRepr::Bool(ring), Item::Bool(v)) => ring[slot] = *v,
            (RingRepr::Boxed(ring), _) => ring[slot] = Some(item),
            _ => {
                return Err(BufferError::TypeMismatch {
                    expected: self.element_type,
                    got: item.element_type(),
                });
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Examine the item `offset` positions past the read cursor without
    /// consuming it.
    #[must_use]
    pub fn peek(&self, offset: usize) -> Option<Item> {
        if offset >= self.len {
            return None;
        }
        let slot = (self.head + offset) % self.capacity;
        Some(match &self.repr {
            RingRepr::I64(ring) => Item::I64(ring[slot]),
            RingRepr::F64(ring) => Item::F64(ring[slot]),
            RingRepr::Bool(ring) => Item::Bool(ring[slot]),
            RingRepr::Boxed(ring) => ring[slot].clone()?,
        })
    }

    /// Consume and return the oldest item.
    pub fn pop(&mut self) -> Option<Item> {
        if self.len == 0 {
            return None;
        }
        let slot = self.head;
        let item = match &mut self.repr {
            RingRepr::I64(ring) => Item::I64(ring[slot]),
            RingRepr::F64(ring) => Item::F64(ring[slot]),
            RingRepr::Bool(ring) => Item::Bool(ring[slot]),
            RingRepr::Boxed(ring) => ring[slot].take()?,
        };
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(item)
    }

    /// Consume everything left in FIFO order (drain collection).
    pub fn drain_remaining(&mut self) -> Vec<Item> {
        let mut items = Vec::with_capacity(self.len);
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_wrap_preserves_fifo() {
        let mut buf = ConcreteStorage::new(ElementType::I64, 3);
        for round in 0..5i64 {
            buf.push(Item::I64(round * 2)).unwrap();
            buf.push(Item::I64(round * 2 + 1)).unwrap();
            assert_eq!(buf.pop(), Some(Item::I64(round * 2)));
            assert_eq!(buf.pop(), Some(Item::I64(round * 2 + 1)));
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn full_buffer_rejects() {
        let mut buf = ConcreteStorage::new(ElementType::I64, 2);
        buf.push(Item::I64(1)).unwrap();
        buf.push(Item::I64(2)).unwrap();
        assert_eq!(
            buf.push(Item::I64(3)),
            Err(BufferError::Full { capacity: 2 })
        );
    }

    #[test]
    fn unboxed_buffer_rejects_wrong_type() {
        let mut buf = ConcreteStorage::new(ElementType::I64, 4);
        assert_eq!(
            buf.push(Item::Bool(true)),
            Err(BufferError::TypeMismatch {
                expected: ElementType::I64,
                got: ElementType::Bool,
            })
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = ConcreteStorage::new(ElementType::Any, 4);
        buf.push(Item::Text("a".into())).unwrap();
        buf.push(Item::Text("b".into())).unwrap();
        assert_eq!(buf.peek(1), Some(Item::Text("b".into())));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.pop(), Some(Item::Text("a".into())));
    }

    #[test]
    fn capacity_includes_overhang_and_transient() {
        let req = StorageRequirements {
            items_per_iteration: 10,
            peek_overhang: 3,
            init_transient: 5,
        };
        assert_eq!(req.capacity(1), 18);
        assert_eq!(req.capacity(4), 48);
        // Zero multiplier is clamped, never a zero-sized buffer.
        assert_eq!(req.capacity(0), 18);
    }
}
