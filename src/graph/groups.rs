//! The fusion partition: actor groups and their arena.
//!
//! Groups mutate heavily during fusion (merging member sets, retiring
//! emptied groups), so they live in an arena indexed by stable integer ids
//! with a "current owning group" map per actor, rather than as a live
//! object graph with back-pointers.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

use crate::graph::builder::StreamGraph;
use crate::types::{ActorId, GroupId, StorageId};

/// A set of actors to be fused into one executable unit.
///
/// Carries the group's internal schedule once computed: how many times each
/// member actor fires per one firing of the group.
#[derive(Clone, Debug)]
pub struct ActorGroup {
    id: GroupId,
    actors: BTreeSet<ActorId>,
    schedule: FxHashMap<ActorId, u64>,
}

impl ActorGroup {
    fn singleton(id: GroupId, actor: ActorId) -> Self {
        let mut actors = BTreeSet::new();
        actors.insert(actor);
        let mut schedule = FxHashMap::default();
        schedule.insert(actor, 1);
        Self {
            id,
            actors,
            schedule,
        }
    }

    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub fn actors(&self) -> &BTreeSet<ActorId> {
        &self.actors
    }

    #[must_use]
    pub fn contains(&self, actor: ActorId) -> bool {
        self.actors.contains(&actor)
    }

    /// The internal schedule: firings of each member per group firing.
    /// Empty until (re)computed by the fusion engine or compiler.
    #[must_use]
    pub fn schedule(&self) -> &FxHashMap<ActorId, u64> {
        &self.schedule
    }

    /// Firings of `actor` per group firing, defaulting to 0 for non-members.
    #[must_use]
    pub fn firings_of(&self, actor: ActorId) -> u64 {
        self.schedule.get(&actor).copied().unwrap_or(0)
    }
}

/// Arena of [`ActorGroup`]s with stable ids and per-actor ownership.
///
/// Starts as one singleton group per actor; fusion merges pairs and retires
/// the absorbed group's slot. Retired ids are never reused within one
/// compilation.
#[derive(Clone, Debug)]
pub struct GroupArena {
    slots: Vec<Option<ActorGroup>>,
    owner: Vec<GroupId>,
}

impl GroupArena {
    /// One singleton group per actor, ids matching actor order.
    #[must_use]
    pub fn singletons(graph: &StreamGraph) -> Self {
        let mut slots = Vec::with_capacity(graph.actors().len());
        let mut owner = Vec::with_capacity(graph.actors().len());
        for actor in graph.actors() {
            let gid = GroupId(slots.len() as u32);
            slots.push(Some(ActorGroup::singleton(gid, actor.id())));
            owner.push(gid);
        }
        Self { slots, owner }
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&ActorGroup> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// The group currently owning `actor`.
    ///
    /// Ownership is total for every actor of the graph this arena was built
    /// from; passing a foreign actor id is a caller bug.
    #[must_use]
    pub fn group_of(&self, actor: ActorId) -> GroupId {
        self.owner[actor.0 as usize]
    }

    /// Live groups in ascending id order.
    pub fn groups(&self) -> impl Iterator<Item = &ActorGroup> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Ids of live groups in ascending order.
    pub fn group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.groups().map(ActorGroup::id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge group `from` into group `into`, retiring `from`'s slot.
    ///
    /// Internal schedules of both groups are invalidated; the caller
    /// recomputes the merged schedule via the rate solver.
    pub fn fuse(&mut self, into: GroupId, from: GroupId) {
        debug_assert_ne!(into, from);
        let absorbed = self.slots[from.0 as usize]
            .take()
            .map(|g| g.actors)
            .unwrap_or_default();
        if let Some(target) = self.slots[into.0 as usize].as_mut() {
            for actor in absorbed {
                self.owner[actor.0 as usize] = into;
                target.actors.insert(actor);
            }
            target.schedule.clear();
        }
    }

    /// Install a freshly solved internal schedule on a group.
    pub fn set_schedule(&mut self, id: GroupId, schedule: FxHashMap<ActorId, u64>) {
        if let Some(group) = self.slots[id.0 as usize].as_mut() {
            group.schedule = schedule;
        }
    }

    /// Remove an actor from the partition (transformation passes). The
    /// owning group is deleted when it becomes empty.
    pub fn remove_actor(&mut self, actor: ActorId) -> GroupId {
        let gid = self.group_of(actor);
        if let Some(group) = self.slots[gid.0 as usize].as_mut() {
            group.actors.remove(&actor);
            group.schedule.remove(&actor);
            if group.actors.is_empty() {
                self.slots[gid.0 as usize] = None;
            }
        }
        gid
    }

    /// Storages feeding this group from outside (other groups or boundary
    /// tokens), in member/port order.
    #[must_use]
    pub fn group_inputs(&self, graph: &StreamGraph, id: GroupId) -> Vec<StorageId> {
        let Some(group) = self.group(id) else {
            return Vec::new();
        };
        let mut inputs = Vec::new();
        for actor in group.actors() {
            let Ok(a) = graph.actor(*actor) else { continue };
            for port in a.inputs() {
                let Ok(storage) = graph.storage(port.storage) else {
                    continue;
                };
                if !graph.is_internal(storage, self) {
                    inputs.push(port.storage);
                }
            }
        }
        inputs
    }

    /// Storages this group feeds outward, in member/port order.
    #[must_use]
    pub fn group_outputs(&self, graph: &StreamGraph, id: GroupId) -> Vec<StorageId> {
        let Some(group) = self.group(id) else {
            return Vec::new();
        };
        let mut outputs = Vec::new();
        for actor in group.actors() {
            let Ok(a) = graph.actor(*actor) else { continue };
            for port in a.outputs() {
                let Ok(storage) = graph.storage(port.storage) else {
                    continue;
                };
                if !graph.is_internal(storage, self) {
                    outputs.push(port.storage);
                }
            }
        }
        outputs
    }

    /// Groups producing into this group.
    #[must_use]
    pub fn predecessor_groups(&self, graph: &StreamGraph, id: GroupId) -> BTreeSet<GroupId> {
        self.group_inputs(graph, id)
            .into_iter()
            .filter_map(|sid| {
                let storage = graph.storage(sid).ok()?;
                let upstream = storage.upstream_actor()?;
                Some(self.group_of(upstream))
            })
            .filter(|gid| *gid != id)
            .collect()
    }

    /// Groups consuming from this group.
    #[must_use]
    pub fn successor_groups(&self, graph: &StreamGraph, id: GroupId) -> BTreeSet<GroupId> {
        self.group_outputs(graph, id)
            .into_iter()
            .filter_map(|sid| {
                let storage = graph.storage(sid).ok()?;
                let downstream = storage.downstream_actor()?;
                Some(self.group_of(downstream))
            })
            .filter(|gid| *gid != id)
            .collect()
    }

    /// Whether any member actor peeks on a group-external input.
    ///
    /// Peeked-but-unconsumed data cannot be soundly reordered across a
    /// merge boundary, so peeking groups are excluded from fusion.
    #[must_use]
    pub fn is_peeking(&self, graph: &StreamGraph, id: GroupId) -> bool {
        let Some(group) = self.group(id) else {
            return false;
        };
        group.actors().iter().any(|actor| {
            let Ok(a) = graph.actor(*actor) else {
                return false;
            };
            a.inputs().iter().any(|port| {
                let Ok(storage) = graph.storage(port.storage) else {
                    return false;
                };
                port.rate.is_peeking() && !graph.is_internal(storage, self)
            })
        })
    }

    /// Topological order of the live group DAG, upstream first.
    ///
    /// Returns `None` if the group graph contains a cycle (feedback loops
    /// are unschedulable).
    #[must_use]
    pub fn topological_order(&self, graph: &StreamGraph) -> Option<Vec<GroupId>> {
        let ids: Vec<GroupId> = self.group_ids().collect();
        let mut indegree: FxHashMap<GroupId, usize> = ids
            .iter()
            .map(|id| (*id, self.predecessor_groups(graph, *id).len()))
            .collect();
        // BTreeSet keeps extraction deterministic (smallest id first).
        let mut ready: BTreeSet<GroupId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for succ in self.successor_groups(graph, next) {
                if let Some(d) = indegree.get_mut(&succ) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(succ);
                    }
                }
            }
        }
        (order.len() == ids.len()).then_some(order)
    }
}
