//! Initialization (priming) schedule computation.
//!
//! Steady-state firing assumes every buffer already holds the offsets its
//! peek/pop windows require. Before that is true, a priming phase runs
//! extra firings: `actual_init[g]` firings of each group to fill its
//! consumers' required read indices, plus allowances for everything
//! downstream, combined bottom-up into `total_init[g]`.
//!
//! The per-group loop stops as soon as one more firing contributes no new
//! required index. That monotonic-coverage stop rule is inherited from the
//! original design and is not proven for all rate patterns, so the loop is
//! additionally capped at [`MAX_INIT_FIRINGS`] and reports divergence
//! loudly instead of spinning.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

use crate::graph::{GroupArena, StreamGraph};
use crate::schedule::solver::Schedule;
use crate::types::{GroupId, StorageId};

/// Hard cap on per-group init firings; exceeding it means the coverage
/// loop is not converging for this rate pattern.
pub const MAX_INIT_FIRINGS: u64 = 1 << 20;

/// Failure computing the initialization schedule.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum InitError {
    #[error("group graph contains a cycle; no priming order exists")]
    #[diagnostic(code(streamfuse::init::cyclic))]
    Cyclic,

    #[error("storage {storage} has unresolved rates at init scheduling")]
    #[diagnostic(
        code(streamfuse::init::unresolved_rate),
        help("range rates must be resolved to fixed choices before compilation")
    )]
    UnresolvedRate { storage: StorageId },

    #[error("init schedule for group {group} exceeded {cap} firings without covering required reads")]
    #[diagnostic(code(streamfuse::init::diverged))]
    Diverged { group: GroupId, cap: u64 },
}

/// Per-group priming firing counts.
#[derive(Clone, Debug, Default)]
pub struct InitSchedule {
    actual: FxHashMap<GroupId, u64>,
    total: FxHashMap<GroupId, u64>,
}

impl InitSchedule {
    /// Firings of `group` needed to fill its own consumers' read indices.
    #[must_use]
    pub fn actual_init(&self, group: GroupId) -> u64 {
        self.actual.get(&group).copied().unwrap_or(0)
    }

    /// Firings of `group` to execute before steady-state cycling begins,
    /// including allowances for every downstream group's priming.
    #[must_use]
    pub fn total_init(&self, group: GroupId) -> u64 {
        self.total.get(&group).copied().unwrap_or(0)
    }

    /// Compute the init schedule for a fused, externally scheduled graph.
    pub fn compute(
        graph: &StreamGraph,
        groups: &GroupArena,
        external: &Schedule<GroupId>,
    ) -> Result<Self, InitError> {
        let order = groups.topological_order(graph).ok_or(InitError::Cyclic)?;

        // Required absolute read indices per consumer-facing storage: the
        // window the first steady-state iteration will read, less any items
        // seeded from a previous configuration's drain.
        let mut required: FxHashMap<StorageId, BTreeSet<u64>> = FxHashMap::default();
        for storage in graph.storages() {
            if graph.is_internal(storage, groups) {
                continue;
            }
            let Some(consumer) = storage.downstream_actor() else {
                // Boundary outputs are read externally; nothing to prime.
                continue;
            };
            let pop = graph
                .pop_rate(storage)
                .ok_or(InitError::UnresolvedRate { storage: storage.id() })?;
            let peek = graph
                .peek_rate(storage)
                .ok_or(InitError::UnresolvedRate { storage: storage.id() })?;
            let consumer_group = groups.group_of(consumer);
            let firings = groups
                .group(consumer_group)
                .map(|g| g.firings_of(consumer))
                .unwrap_or(0)
                * external.multiplicity(&consumer_group);
            let throughput = firings * pop;
            let overhang = peek.saturating_sub(pop);
            let seeded = storage.initial_items().len() as u64;
            let needed = (throughput + overhang).saturating_sub(seeded);
            required.insert(storage.id(), (0..needed).collect());
        }

        // Actual init per group: fire until one more firing removes no
        // further required index from any output storage.
        let mut actual: FxHashMap<GroupId, u64> = FxHashMap::default();
        for &gid in &order {
            let Some(group) = groups.group(gid) else { continue };
            // Items written to each actor-consumed output per group firing.
            let mut write_quanta: Vec<(StorageId, u64)> = Vec::new();
            for sid in groups.group_outputs(graph, gid) {
                let Ok(storage) = graph.storage(sid) else { continue };
                if storage.downstream_actor().is_none() {
                    continue;
                }
                let Some(producer) = storage.upstream_actor() else {
                    continue;
                };
                let push = graph
                    .push_rate(storage)
                    .ok_or(InitError::UnresolvedRate { storage: sid })?;
                write_quanta.push((sid, push * group.firings_of(producer)));
            }

            let mut firings = 0u64;
            loop {
                let mut changed = false;
                for (sid, quantum) in &write_quanta {
                    if let Some(indices) = required.get_mut(sid) {
                        let lo = firings * quantum;
                        let hi = lo + quantum;
                        for idx in lo..hi {
                            changed |= indices.remove(&idx);
                        }
                    }
                }
                if !changed {
                    break;
                }
                firings += 1;
                if firings > MAX_INIT_FIRINGS {
                    return Err(InitError::Diverged {
                        group: gid,
                        cap: MAX_INIT_FIRINGS,
                    });
                }
            }
            actual.insert(gid, firings);
        }

        // Total init bottom-up: sinks keep their actual init; everything
        // else adds the ceiling-scaled maximum of its successors' totals.
        let mut total: FxHashMap<GroupId, u64> = FxHashMap::default();
        for &gid in order.iter().rev() {
            let own = actual.get(&gid).copied().unwrap_or(0);
            let successors = groups.successor_groups(graph, gid);
            if successors.is_empty() {
                total.insert(gid, own);
                continue;
            }
            let us = external.multiplicity(&gid);
            let downstream_max = successors
                .iter()
                .map(|s| {
                    let them = external.multiplicity(s).max(1);
                    let st = total.get(s).copied().unwrap_or(0);
                    // them * (us / them) = us; round up.
                    (st * us).div_ceil(them)
                })
                .max()
                .unwrap_or(0);
            total.insert(gid, downstream_max + own);
        }

        debug!(groups = order.len(), "init schedule computed");
        Ok(Self { actual, total })
    }
}
