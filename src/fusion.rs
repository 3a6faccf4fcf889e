//! The fusion engine: merging adjacent groups under configuration control.
//!
//! Starting from one singleton group per actor, the engine repeatedly scans
//! groups in ascending id order and fuses a candidate into its unique
//! predecessor when every precondition holds, restarting the scan after
//! each merge until a fixed point. This is iterated edge contraction on
//! the group DAG: one pairwise merge per iteration, never a multi-way
//! merge.
//!
//! Preconditions (violations are skip conditions, not errors):
//! - exactly one predecessor group
//! - no member actor peeking on a group-external input
//! - the configuration switch `fuse<gid>` is on
//! - no edge being internalized carries seeded initial items (fusing across
//!   initial data reorders it unsoundly, so it is checked explicitly)
//!
//! Fusing two groups unions their actor sets and re-solves the merged
//! internal schedule; it never mutates actor or storage identities.

use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace};

use crate::config::Configuration;
use crate::graph::{GroupArena, StreamGraph};
use crate::schedule::solver::{Schedule, ScheduleBuilder, ScheduleError};
use crate::types::{ActorId, GroupId};

/// Run the fusion fixed point. Returns the number of merges performed.
///
/// Idempotent: running again on an already-fixed-point partition performs
/// zero merges and leaves the arena untouched.
#[instrument(skip_all, fields(groups = groups.len()))]
pub fn fuse_groups(
    graph: &StreamGraph,
    groups: &mut GroupArena,
    config: &Configuration,
) -> Result<usize, ScheduleError> {
    let mut merges = 0;
    'outer: loop {
        let candidates: Vec<GroupId> = groups.group_ids().collect();
        for gid in candidates {
            match fusion_candidate(graph, groups, config, gid) {
                Ok(predecessor) => {
                    groups.fuse(predecessor, gid);
                    let schedule = solve_internal_schedule(graph, groups, predecessor)?;
                    groups.set_schedule(predecessor, schedule.multiplicities().clone());
                    merges += 1;
                    debug!(%gid, into = %predecessor, "fused group into predecessor");
                    continue 'outer;
                }
                Err(skip) => {
                    trace!(%gid, ?skip, "fusion candidate skipped");
                }
            }
        }
        break;
    }
    debug!(merges, remaining = groups.len(), "fusion fixed point reached");
    Ok(merges)
}

/// Why a group was not fused this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionSkip {
    /// No upstream group to fuse into.
    NoPredecessor,
    /// Fusing with multiple predecessors in one step is disallowed.
    MultiplePredecessors,
    /// A member actor peeks on a group-external input.
    Peeking,
    /// The configuration switch for this group is off.
    SwitchedOff,
    /// An edge that would become internal carries seeded initial items.
    InitialData,
}

fn fusion_candidate(
    graph: &StreamGraph,
    groups: &GroupArena,
    config: &Configuration,
    gid: GroupId,
) -> Result<GroupId, FusionSkip> {
    if !config.fuse(gid) {
        return Err(FusionSkip::SwitchedOff);
    }
    if groups.is_peeking(graph, gid) {
        return Err(FusionSkip::Peeking);
    }
    let mut predecessors = groups.predecessor_groups(graph, gid).into_iter();
    let predecessor = match (predecessors.next(), predecessors.next()) {
        (Some(only), None) => only,
        (None, _) => return Err(FusionSkip::NoPredecessor),
        (Some(_), Some(_)) => return Err(FusionSkip::MultiplePredecessors),
    };
    // The storages internalized by this merge are g's inputs fed by the
    // predecessor; seeded items on any of them block the fusion.
    for sid in groups.group_inputs(graph, gid) {
        let Ok(storage) = graph.storage(sid) else {
            continue;
        };
        let from_predecessor = storage
            .upstream_actor()
            .is_some_and(|u| groups.group_of(u) == predecessor);
        if from_predecessor && storage.has_initial_items() {
            return Err(FusionSkip::InitialData);
        }
    }
    Ok(predecessor)
}

/// Solve the internal schedule of one group: firings of each member actor
/// per group firing, balanced over the group's internal edges.
pub(crate) fn solve_internal_schedule(
    graph: &StreamGraph,
    groups: &GroupArena,
    gid: GroupId,
) -> Result<Schedule<ActorId>, ScheduleError> {
    let mut builder: ScheduleBuilder<ActorId> = ScheduleBuilder::new();
    let members: Vec<ActorId> = groups
        .group(gid)
        .map(|g| g.actors().iter().copied().collect())
        .unwrap_or_default();
    builder.add_all(members.iter().copied());
    for &actor in &members {
        let Ok(a) = graph.actor(actor) else { continue };
        for port in a.outputs() {
            let Ok(storage) = graph.storage(port.storage) else {
                continue;
            };
            if !graph.is_internal(storage, groups) {
                continue;
            }
            let Some(downstream) = storage.downstream_actor() else {
                continue;
            };
            let (Some(push), Some(pop), Some(peek)) = (
                graph.push_rate(storage),
                graph.pop_rate(storage),
                graph.peek_rate(storage),
            ) else {
                // Unresolved rates never reach scheduling; the compiler
                // validates fixed rates before fusing.
                return Err(ScheduleError::Underconstrained {
                    node: actor.to_string(),
                });
            };
            builder
                .connect(actor, downstream)
                .push(push)
                .pop(pop)
                .peek(peek);
        }
    }
    builder.solve()
}

/// Build the initial internal schedules for a fresh singleton partition.
///
/// Singleton groups trivially fire their one actor once per group firing,
/// but going through the solver keeps the invariant that every live group's
/// schedule came from the balance system.
pub(crate) fn solve_all_internal_schedules(
    graph: &StreamGraph,
    groups: &mut GroupArena,
) -> Result<(), ScheduleError> {
    let ids: Vec<GroupId> = groups.group_ids().collect();
    for gid in ids {
        let schedule = solve_internal_schedule(graph, groups, gid)?;
        let map: FxHashMap<ActorId, u64> = schedule.multiplicities().clone();
        groups.set_schedule(gid, map);
    }
    Ok(())
}
