//! The compilation pipeline: graph in, executable plan out.
//!
//! Runs the passes in dependency order, mirroring the stage list a
//! configuration travels through:
//!
//! 1. validate that every scheduled rate is fixed
//! 2. build the singleton group partition and internal schedules
//! 3. fuse groups as directed by the configuration
//! 4. solve the external (group-level) steady-state schedule
//! 5. narrow storage element types (unboxing)
//! 6. compute the boundary token schedule (items per steady iteration)
//! 7. compute the initialization schedule
//! 8. size every non-internal buffer
//!
//! Failures are [`CompileError`]s: recoverable at the configuration level
//! (the tuning loop rejects this configuration and proposes another) but
//! fatal to compiling this one. Nothing here mutates a running instance.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::buffers::{self, BufferError, ConcreteStorage, StorageRequirements};
use crate::config::Configuration;
use crate::fusion;
use crate::graph::{GraphError, GroupArena, StreamGraph};
use crate::schedule::init::{InitError, InitSchedule};
use crate::schedule::solver::{Schedule, ScheduleBuilder, ScheduleError};
use crate::types::{ActorId, GroupId, MachineId, StorageId, Token};

/// Failure compiling one configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("actor {actor} has unresolved range rates; it cannot be scheduled")]
    #[diagnostic(
        code(streamfuse::compile::unresolved_rate),
        help("resolve every range rate to a fixed choice before compiling")
    )]
    UnresolvedRate { actor: ActorId },

    #[error("couldn't find internal schedule for group {group}")]
    #[diagnostic(code(streamfuse::compile::internal_schedule))]
    InternalSchedule {
        group: GroupId,
        #[source]
        #[diagnostic_source]
        source: ScheduleError,
    },

    #[error("couldn't find external schedule")]
    #[diagnostic(code(streamfuse::compile::external_schedule))]
    ExternalSchedule {
        #[source]
        #[diagnostic_source]
        source: ScheduleError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Buffer(#[from] BufferError),
}

/// Assignment of groups to machines.
///
/// Groups without an explicit entry run on machine 0, so a single-machine
/// execution needs no partition setup at all.
#[derive(Clone, Debug, Default)]
pub struct PartitionMap {
    assignments: FxHashMap<GroupId, MachineId>,
}

impl PartitionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn assign(mut self, group: GroupId, machine: MachineId) -> Self {
        self.assignments.insert(group, machine);
        self
    }

    #[must_use]
    pub fn machine_of(&self, group: GroupId) -> MachineId {
        self.assignments
            .get(&group)
            .copied()
            .unwrap_or(MachineId(0))
    }

    /// All machines referenced by this partition (always includes the
    /// default machine 0).
    #[must_use]
    pub fn machines(&self) -> BTreeSet<MachineId> {
        let mut machines: BTreeSet<MachineId> = self.assignments.values().copied().collect();
        machines.insert(MachineId(0));
        machines
    }
}

/// The complete output of compiling one configuration: the fused partition,
/// both schedules, buffer requirements, and the boundary token schedule.
#[derive(Clone, Debug)]
pub struct CompiledPlan {
    graph: StreamGraph,
    groups: GroupArena,
    external: Schedule<GroupId>,
    init: InitSchedule,
    requirements: FxHashMap<StorageId, StorageRequirements>,
    token_reads: FxHashMap<Token, u64>,
    token_writes: FxHashMap<Token, u64>,
}

impl CompiledPlan {
    #[must_use]
    pub fn graph(&self) -> &StreamGraph {
        &self.graph
    }

    #[must_use]
    pub fn groups(&self) -> &GroupArena {
        &self.groups
    }

    /// The external steady-state schedule over groups.
    #[must_use]
    pub fn external_schedule(&self) -> &Schedule<GroupId> {
        &self.external
    }

    #[must_use]
    pub fn init_schedule(&self) -> &InitSchedule {
        &self.init
    }

    /// Buffer sizing for every non-internal storage.
    #[must_use]
    pub fn requirements(&self) -> &FxHashMap<StorageId, StorageRequirements> {
        &self.requirements
    }

    /// Items read from each boundary input token per steady iteration.
    #[must_use]
    pub fn token_reads(&self) -> &FxHashMap<Token, u64> {
        &self.token_reads
    }

    /// Items written to each boundary output token per steady iteration.
    #[must_use]
    pub fn token_writes(&self) -> &FxHashMap<Token, u64> {
        &self.token_writes
    }

    /// Groups in topological order, upstream first.
    ///
    /// The order exists: compilation already required it for the init
    /// schedule.
    #[must_use]
    pub fn group_order(&self) -> Vec<GroupId> {
        self.groups
            .topological_order(&self.graph)
            .unwrap_or_default()
    }

    /// Instantiate concrete buffers for every non-internal storage, sized
    /// with the producing machine's multiplier.
    pub fn allocate_buffers(
        &self,
        partition: &PartitionMap,
        config: &Configuration,
    ) -> Result<FxHashMap<StorageId, ConcreteStorage>, CompileError> {
        let mut allocated = FxHashMap::default();
        for (sid, req) in &self.requirements {
            let storage = self.graph.storage(*sid)?;
            let owner = storage
                .upstream_actor()
                .or_else(|| storage.downstream_actor())
                .map(|a| self.groups.group_of(a))
                .map(|g| partition.machine_of(g))
                .unwrap_or(MachineId(0));
            let multiplier = config.multiplier(owner);
            allocated.insert(
                *sid,
                ConcreteStorage::for_storage(&self.graph, *sid, req, multiplier)?,
            );
        }
        debug!(buffers = allocated.len(), "concrete storage allocated");
        Ok(allocated)
    }
}

/// Compile one configuration of a stream graph into a [`CompiledPlan`].
#[instrument(skip_all, fields(actors = graph.actors().len()))]
pub fn compile(mut graph: StreamGraph, config: &Configuration) -> Result<CompiledPlan, CompileError> {
    // Scheduling requires fixed rates everywhere; fail before any pass
    // rather than half-way through.
    for actor in graph.actors() {
        if !actor.rates_fixed() {
            return Err(CompileError::UnresolvedRate { actor: actor.id() });
        }
    }

    let mut groups = GroupArena::singletons(&graph);
    fusion::solve_all_internal_schedules(&graph, &mut groups).map_err(|source| {
        CompileError::InternalSchedule {
            group: GroupId(0),
            source,
        }
    })?;

    fusion::fuse_groups(&graph, &mut groups, config).map_err(|source| {
        CompileError::InternalSchedule {
            group: GroupId(0),
            source,
        }
    })?;

    let external = external_schedule(&graph, &groups)?;
    graph.unbox();
    let (token_reads, token_writes) = token_schedule(&graph, &groups, &external);
    let init = InitSchedule::compute(&graph, &groups, &external)?;
    let requirements = buffers::compute_requirements(&graph, &groups, &external, &init)?;

    debug!(
        groups = groups.len(),
        buffers = requirements.len(),
        "configuration compiled"
    );
    Ok(CompiledPlan {
        graph,
        groups,
        external,
        init,
        requirements,
        token_reads,
        token_writes,
    })
}

/// Solve the group-level steady-state schedule: each group is a node whose
/// edge rates are the member rates scaled by the internal multiplicities.
fn external_schedule(
    graph: &StreamGraph,
    groups: &GroupArena,
) -> Result<Schedule<GroupId>, CompileError> {
    let mut builder: ScheduleBuilder<GroupId> = ScheduleBuilder::new();
    builder.add_all(groups.group_ids());
    for gid in groups.group_ids() {
        for sid in groups.group_outputs(graph, gid) {
            let Ok(storage) = graph.storage(sid) else {
                continue;
            };
            let (Some(producer), Some(consumer)) =
                (storage.upstream_actor(), storage.downstream_actor())
            else {
                continue; // boundary edges don't constrain the group graph
            };
            let other = groups.group_of(consumer);
            let upstream_adjust = groups
                .group(gid)
                .map(|g| g.firings_of(producer))
                .unwrap_or(0);
            let downstream_adjust = groups
                .group(other)
                .map(|g| g.firings_of(consumer))
                .unwrap_or(0);
            let (Some(push), Some(pop), Some(peek)) = (
                graph.push_rate(storage),
                graph.pop_rate(storage),
                graph.peek_rate(storage),
            ) else {
                return Err(CompileError::UnresolvedRate { actor: producer });
            };
            builder
                .connect(gid, other)
                .push(push * upstream_adjust)
                .pop(pop * downstream_adjust)
                .peek(peek * downstream_adjust);
        }
    }
    builder
        .solve()
        .map_err(|source| CompileError::ExternalSchedule { source })
}

/// The boundary token "schedule": items read or written per steady-state
/// iteration across each graph boundary.
fn token_schedule(
    graph: &StreamGraph,
    groups: &GroupArena,
    external: &Schedule<GroupId>,
) -> (FxHashMap<Token, u64>, FxHashMap<Token, u64>) {
    let mut reads = FxHashMap::default();
    let mut writes = FxHashMap::default();
    for storage in graph.storages() {
        if let (Some(token), Some(consumer)) =
            (storage.upstream_token(), storage.downstream_actor())
        {
            let group = groups.group_of(consumer);
            let firings = groups
                .group(group)
                .map(|g| g.firings_of(consumer))
                .unwrap_or(0);
            let pop = graph.pop_rate(storage).unwrap_or(0);
            reads.insert(token, external.multiplicity(&group) * firings * pop);
        }
        if let (Some(producer), Some(token)) =
            (storage.upstream_actor(), storage.downstream_token())
        {
            let group = groups.group_of(producer);
            let firings = groups
                .group(group)
                .map(|g| g.firings_of(producer))
                .unwrap_or(0);
            let push = graph.push_rate(storage).unwrap_or(0);
            writes.insert(token, external.multiplicity(&group) * firings * push);
        }
    }
    (reads, writes)
}
