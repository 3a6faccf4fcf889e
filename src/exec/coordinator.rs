//! The application coordinator: lifecycle, wiring, and the drain protocol.
//!
//! A [`Coordinator`] owns one stream application across its whole life:
//! compile a configuration, wire buffers and boundary channels, run every
//! work unit's cores on tokio tasks, and orchestrate drains. The lifecycle
//! is a strict state machine:
//!
//! ```text
//! NotStarted -> Compiling -> Running -> Draining -> Stopped
//!                   ^                       |
//!                   |                       v
//!                   +---------------- Reconfiguring
//! ```
//!
//! plus a terminal `Error` state entered when a work unit crashes. A crash
//! never wedges a drain: the crash flag forces drain completion and the
//! error surfaces through [`Coordinator::status`] and
//! [`Coordinator::crash_reason`].
//!
//! The drain protocol runs upstream to downstream: soft-close the overall
//! inputs, then stop each group's cores in topological order (a core keeps
//! firing until it can make no more progress), then stop the boundary
//! channels and collect leftovers. An intermediate drain gathers all
//! residue into [`DrainData`] and seeds it into the next `start`; a final
//! drain discards it.

use futures_util::future::join_all;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::buffers::ConcreteStorage;
use crate::compile::{self, CompileError, CompiledPlan, PartitionMap};
use crate::config::Configuration;
use crate::events::{EventEmitter, ExecEvent};
use crate::exec::channel::{
    BoundaryInputChannel, BoundaryOutputChannel, Channel, ChannelError, FlumeChannel, Frame,
    InputOutcome,
};
use crate::exec::work_unit::{
    BufferHandle, DrainData, DrainKind, Step, WorkUnit, WorkUnitError, WorkUnitFactory,
};
use crate::graph::{GraphError, StreamGraph};
use crate::types::{GroupId, Item, StorageId, Token};

/// How long an idle core waits before re-checking its buffers.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// How long the drain waits for an input channel's marker before forcing
/// it closed.
const DRAIN_MARKER_WAIT: Duration = Duration::from_secs(2);

/// The application lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    NotStarted,
    Compiling,
    Running,
    Draining,
    /// Finally drained; the application will not run again.
    Stopped,
    /// Intermediately drained; awaiting the next configuration.
    Reconfiguring,
    /// A work unit crashed. Terminal, like `Stopped`, but distinguishable.
    Error,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppStatus::NotStarted => "not started",
            AppStatus::Compiling => "compiling",
            AppStatus::Running => "running",
            AppStatus::Draining => "draining",
            AppStatus::Stopped => "stopped",
            AppStatus::Reconfiguring => "reconfiguring",
            AppStatus::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Failure starting, feeding, or draining an application.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    WorkUnit(#[from] WorkUnitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Channel(#[from] ChannelError),

    #[error("cannot {requested} while {from}")]
    #[diagnostic(
        code(streamfuse::exec::invalid_transition),
        help("check status() before driving the lifecycle")
    )]
    InvalidTransition {
        from: AppStatus,
        requested: &'static str,
    },

    #[error("the application has no overall {direction} edge")]
    #[diagnostic(code(streamfuse::exec::no_boundary))]
    NoBoundary { direction: &'static str },

    #[error(
        "buffer for token {token} holds {capacity} items but group {group} needs {needed} per firing"
    )]
    #[diagnostic(
        code(streamfuse::exec::buffer_too_small),
        help("raise the machine's buffer multiplier in the configuration")
    )]
    BufferTooSmall {
        group: GroupId,
        token: Token,
        capacity: usize,
        needed: usize,
    },
}

struct CoreTask {
    group: GroupId,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<(), WorkUnitError>>,
}

enum ChannelSide {
    Output,
    Input,
}

struct ChannelTask {
    token: Token,
    side: ChannelSide,
    stop: flume::Sender<DrainKind>,
    handle: ChannelHandle,
}

enum ChannelHandle {
    Output(JoinHandle<Result<(), ChannelError>>),
    Input(JoinHandle<Result<InputOutcome, ChannelError>>),
}

struct RunningState {
    plan: CompiledPlan,
    units: FxHashMap<GroupId, Box<dyn WorkUnit>>,
    cores: Vec<CoreTask>,
    channels: Vec<ChannelTask>,
    /// Send ends of the overall-input transports, keyed by token.
    input_feeds: FxHashMap<Token, Box<dyn Channel>>,
    /// Receive ends of the overall-output transports, keyed by token.
    output_taps: FxHashMap<Token, Box<dyn Channel>>,
    /// Every ring handle, for leftover collection at drain time. Consumer
    /// sides precede producer sides per token so residue stays in FIFO
    /// order when merged.
    rings: Vec<(Token, BufferHandle)>,
}

/// Owns and drives one stream application.
pub struct Coordinator {
    graph: StreamGraph,
    factory: Arc<dyn WorkUnitFactory>,
    partition: PartitionMap,
    emitter: EventEmitter,
    status: Mutex<AppStatus>,
    crashed: Arc<AtomicBool>,
    crash_reason: Arc<Mutex<Option<String>>>,
    running: Option<RunningState>,
    carryover: DrainData,
}

impl Coordinator {
    #[must_use]
    pub fn new(graph: StreamGraph, factory: Arc<dyn WorkUnitFactory>) -> Self {
        Self {
            graph,
            factory,
            partition: PartitionMap::new(),
            emitter: EventEmitter::disconnected(),
            status: Mutex::new(AppStatus::NotStarted),
            crashed: Arc::new(AtomicBool::new(false)),
            crash_reason: Arc::new(Mutex::new(None)),
            running: None,
            carryover: DrainData::new(),
        }
    }

    /// Assign groups to machines. Unassigned groups run on machine 0.
    #[must_use]
    pub fn with_partition(mut self, partition: PartitionMap) -> Self {
        self.partition = partition;
        self
    }

    /// Emit lifecycle and drain events to the given emitter.
    #[must_use]
    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    #[must_use]
    pub fn status(&self) -> AppStatus {
        *self.status.lock()
    }

    /// Why the application entered [`AppStatus::Error`], if it did.
    #[must_use]
    pub fn crash_reason(&self) -> Option<String> {
        self.crash_reason.lock().clone()
    }

    fn set_status(&self, to: AppStatus) {
        *self.status.lock() = to;
        self.emitter
            .emit(ExecEvent::coordinator(format!("status: {to}")));
        debug!(status = %to, "app status changed");
    }

    fn require(&self, allowed: &[AppStatus], requested: &'static str) -> Result<(), RunError> {
        let from = self.status();
        if allowed.contains(&from) {
            Ok(())
        } else {
            Err(RunError::InvalidTransition { from, requested })
        }
    }

    /// Compile `config`, wire the plan, and start every core.
    ///
    /// Valid from `NotStarted` and `Reconfiguring`. A compile failure
    /// reverts the status so the caller can retry with another
    /// configuration; residue from a previous intermediate drain is seeded
    /// into the new plan's buffers.
    #[instrument(skip_all)]
    pub async fn start(&mut self, config: &Configuration) -> Result<(), RunError> {
        self.require(
            &[AppStatus::NotStarted, AppStatus::Reconfiguring],
            "start",
        )?;
        let revert_to = self.status();
        self.set_status(AppStatus::Compiling);

        let state = match self.build_running_state(config) {
            Ok(state) => state,
            Err(err) => {
                // Configuration-level failure: reject and await another.
                self.set_status(revert_to);
                return Err(err);
            }
        };
        self.carryover = DrainData::new();
        self.running = Some(state);
        self.set_status(AppStatus::Running);
        Ok(())
    }

    fn build_running_state(&self, config: &Configuration) -> Result<RunningState, RunError> {
        let mut graph = self.graph.clone();
        self.seed_carryover(&mut graph)?;
        let plan = compile::compile(graph, config)?;
        let buffers = plan.allocate_buffers(&self.partition, config)?;

        let mut per_group: FxHashMap<GroupId, FxHashMap<Token, BufferHandle>> =
            FxHashMap::default();
        let mut channels = Vec::new();
        let mut input_feeds: FxHashMap<Token, Box<dyn Channel>> = FxHashMap::default();
        let mut output_taps: FxHashMap<Token, Box<dyn Channel>> = FxHashMap::default();
        let mut rings = Vec::new();

        // Deterministic wiring order.
        let mut allocated: Vec<(StorageId, ConcreteStorage)> = buffers.into_iter().collect();
        allocated.sort_by_key(|(sid, _)| *sid);

        for (sid, ring) in allocated {
            let storage = plan.graph().storage(sid)?;
            let Some(token) = storage.token() else {
                continue;
            };
            match (storage.upstream_actor(), storage.downstream_actor()) {
                // Boundary-fed: the coordinator feeds the transport, an
                // input channel fills the consumer ring.
                (None, Some(consumer)) => {
                    let handle = BufferHandle::new(ring);
                    rings.push((token, handle.clone()));
                    let group = plan.groups().group_of(consumer);
                    per_group.entry(group).or_default().insert(token, handle.clone());

                    let (tx, rx) = FlumeChannel::pair(token);
                    let (stop_tx, stop_rx) = flume::unbounded();
                    let handle = BoundaryInputChannel::new(
                        token,
                        handle,
                        Box::new(rx),
                        self.emitter.clone(),
                    )
                    .spawn(stop_rx);
                    channels.push(ChannelTask {
                        token,
                        side: ChannelSide::Input,
                        stop: stop_tx,
                        handle: ChannelHandle::Input(handle),
                    });
                    input_feeds.insert(token, Box::new(tx));
                }
                // Boundary-draining: an output channel pumps the producer
                // ring onto a transport the coordinator reads.
                (Some(producer), None) => {
                    let handle = BufferHandle::new(ring);
                    rings.push((token, handle.clone()));
                    let group = plan.groups().group_of(producer);
                    per_group.entry(group).or_default().insert(token, handle.clone());

                    let (tx, rx) = FlumeChannel::pair(token);
                    let (stop_tx, stop_rx) = flume::unbounded();
                    let handle = BoundaryOutputChannel::new(
                        token,
                        handle,
                        Box::new(tx),
                        self.emitter.clone(),
                    )
                    .spawn(stop_rx);
                    channels.push(ChannelTask {
                        token,
                        side: ChannelSide::Output,
                        stop: stop_tx,
                        handle: ChannelHandle::Output(handle),
                    });
                    output_taps.insert(token, Box::new(rx));
                }
                (Some(producer), Some(consumer)) => {
                    let pg = plan.groups().group_of(producer);
                    let cg = plan.groups().group_of(consumer);
                    if self.partition.machine_of(pg) == self.partition.machine_of(cg) {
                        // Same machine: one shared ring, no channel.
                        let handle = BufferHandle::new(ring);
                        rings.push((token, handle.clone()));
                        per_group.entry(pg).or_default().insert(token, handle.clone());
                        per_group.entry(cg).or_default().insert(token, handle);
                    } else {
                        // Machine boundary: a ring per side, bridged by a
                        // channel pair. Seeded items sit on the consumer
                        // side (the allocated ring).
                        let consumer_handle = BufferHandle::new(ring);
                        let producer_handle = BufferHandle::new(ConcreteStorage::new(
                            storage.element_type(),
                            consumer_handle.capacity(),
                        ));
                        rings.push((token, consumer_handle.clone()));
                        rings.push((token, producer_handle.clone()));
                        per_group
                            .entry(pg)
                            .or_default()
                            .insert(token, producer_handle.clone());
                        per_group
                            .entry(cg)
                            .or_default()
                            .insert(token, consumer_handle.clone());

                        let (tx, rx) = FlumeChannel::pair(token);
                        let (out_stop_tx, out_stop_rx) = flume::unbounded();
                        let out = BoundaryOutputChannel::new(
                            token,
                            producer_handle,
                            Box::new(tx),
                            self.emitter.clone(),
                        )
                        .spawn(out_stop_rx);
                        channels.push(ChannelTask {
                            token,
                            side: ChannelSide::Output,
                            stop: out_stop_tx,
                            handle: ChannelHandle::Output(out),
                        });
                        let (in_stop_tx, in_stop_rx) = flume::unbounded();
                        let inp = BoundaryInputChannel::new(
                            token,
                            consumer_handle,
                            Box::new(rx),
                            self.emitter.clone(),
                        )
                        .spawn(in_stop_rx);
                        channels.push(ChannelTask {
                            token,
                            side: ChannelSide::Input,
                            stop: in_stop_tx,
                            handle: ChannelHandle::Input(inp),
                        });
                    }
                }
                (None, None) => continue,
            }
        }

        // Build units and start their cores, upstream first.
        let mut units: FxHashMap<GroupId, Box<dyn WorkUnit>> = FxHashMap::default();
        let mut cores = Vec::new();
        for gid in plan.group_order() {
            let mut unit = self.factory.build(&plan, gid)?;
            let buffers = per_group.remove(&gid).unwrap_or_default();
            for token in unit.tokens() {
                // Missing buffers are install_buffers' problem; here we only
                // reject rings too small for a single firing.
                let Some(handle) = buffers.get(&token) else {
                    continue;
                };
                let needed = unit.min_buffer_capacity(token);
                if handle.capacity() < needed {
                    return Err(RunError::BufferTooSmall {
                        group: gid,
                        token,
                        capacity: handle.capacity(),
                        needed,
                    });
                }
            }
            unit.install_buffers(buffers)?;
            for core in 0..unit.core_count() {
                let code = unit.core_code(core)?;
                let stop = Arc::new(AtomicBool::new(false));
                let handle = spawn_core(
                    code,
                    Arc::clone(&stop),
                    Arc::clone(&self.crashed),
                    Arc::clone(&self.crash_reason),
                    self.emitter.clone(),
                    gid,
                );
                cores.push(CoreTask {
                    group: gid,
                    stop,
                    handle,
                });
            }
            self.emitter
                .emit(ExecEvent::work_unit(gid, format!("started {} cores", unit.core_count())));
            units.insert(gid, unit);
        }

        Ok(RunningState {
            plan,
            units,
            cores,
            channels,
            input_feeds,
            output_taps,
            rings,
        })
    }

    /// Seed intermediate-drain residue into the matching storages of a
    /// fresh graph copy, by token.
    fn seed_carryover(&self, graph: &mut StreamGraph) -> Result<(), RunError> {
        if self.carryover.is_empty() {
            return Ok(());
        }
        let by_token: FxHashMap<Token, StorageId> = graph
            .storages()
            .iter()
            .filter_map(|s| Some((s.token()?, s.id())))
            .collect();
        for token in self.carryover.tokens() {
            let Some(&sid) = by_token.get(&token) else {
                // The new graph no longer has this edge; residue is lost
                // and worth a warning, not a failure.
                warn!(%token, "drain residue has no matching edge in the new graph");
                continue;
            };
            let items = self.carryover.items_for(token).to_vec();
            graph.storage_mut(sid)?.seed(items);
        }
        Ok(())
    }

    /// Feed one item into the overall input edge.
    pub async fn push_input(&mut self, item: Item) -> Result<(), RunError> {
        self.require(&[AppStatus::Running], "push input")?;
        let state = self
            .running
            .as_mut()
            .ok_or(RunError::InvalidTransition {
                from: AppStatus::NotStarted,
                requested: "push input",
            })?;
        let feed = state
            .input_feeds
            .get_mut(&Token::OverallInput)
            .ok_or(RunError::NoBoundary { direction: "input" })?;
        feed.send(Frame::Item(item)).await?;
        Ok(())
    }

    /// Await the next item from the overall output edge. Returns `None`
    /// once the output side has drained and closed.
    pub async fn next_output(&mut self) -> Result<Option<Item>, RunError> {
        let state = self
            .running
            .as_mut()
            .ok_or(RunError::InvalidTransition {
                from: AppStatus::NotStarted,
                requested: "read output",
            })?;
        let tap = state
            .output_taps
            .get_mut(&Token::OverallOutput)
            .ok_or(RunError::NoBoundary {
                direction: "output",
            })?;
        loop {
            match tap.receive().await {
                Ok(Frame::Item(item)) => return Ok(Some(item)),
                Ok(Frame::Drain(_)) | Err(ChannelError::Closed { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drain the application.
    ///
    /// Stops feeding, flushes every group upstream to downstream, stops the
    /// boundary channels, and collects residue. [`DrainKind::Intermediate`]
    /// returns the residue (and re-seeds it into the next [`start`](Self::start));
    /// [`DrainKind::Final`] discards it and returns an empty [`DrainData`].
    ///
    /// A work-unit crash during the run or the drain never blocks this
    /// method: the drain completes and the status lands on
    /// [`AppStatus::Error`] instead of `Stopped`/`Reconfiguring`.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn drain(&mut self, kind: DrainKind) -> Result<DrainData, RunError> {
        self.require(&[AppStatus::Running], "drain")?;
        let mut state = self.running.take().ok_or(RunError::InvalidTransition {
            from: AppStatus::Running,
            requested: "drain",
        })?;
        self.set_status(AppStatus::Draining);

        // 1. Soft-close the overall inputs: drain markers flow downstream.
        for (token, feed) in &mut state.input_feeds {
            if feed.send(Frame::Drain(kind)).await.is_err() {
                warn!(%token, "input transport already closed at drain");
            }
            feed.close();
        }

        // 2. Flush and stop each group's cores, upstream first. A stopped
        // core keeps firing until it makes no more progress, so upstream
        // residue flows as far downstream as the schedules allow.
        let mut data = DrainData::new();
        let mut cores = std::mem::take(&mut state.cores);
        for gid in state.plan.group_order() {
            let (mine, rest): (Vec<_>, Vec<_>) = cores.into_iter().partition(|c| c.group == gid);
            cores = rest;
            for core in &mine {
                core.stop.store(true, Ordering::Relaxed);
            }
            for joined in join_all(mine.into_iter().map(|c| c.handle)).await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => self.record_crash(err.to_string()),
                    Err(join) => self.record_crash(format!("core task panicked: {join}")),
                }
            }
            if let Some(unit) = state.units.get_mut(&gid) {
                unit.drain(kind);
                if kind == DrainKind::Intermediate {
                    data.merge(unit.drain_data());
                }
                self.emitter
                    .emit(ExecEvent::work_unit(gid, "drained"));
            }
        }

        // 3. Output channels first (they emit the markers input channels
        // are waiting for), then input channels. Input leftovers are newer
        // than the ring residue on the same token, so they are held aside
        // until the rings are collected in step 4.
        let mut channel_leftovers: FxHashMap<Token, Vec<Item>> = FxHashMap::default();
        for task in state
            .channels
            .iter()
            .filter(|t| matches!(t.side, ChannelSide::Output))
        {
            let _ = task.stop.send(kind);
        }
        for task in state.channels {
            match task.handle {
                ChannelHandle::Output(handle) => match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => self.record_crash(err.to_string()),
                    Err(join) => self.record_crash(format!("channel task panicked: {join}")),
                },
                ChannelHandle::Input(mut handle) => {
                    // The marker normally arrives on its own; force-stop
                    // if it doesn't (crashed or backlogged upstream). The
                    // stop path salvages the transport backlog, so the
                    // join is still awaited for its leftovers.
                    let joined =
                        match tokio::time::timeout(DRAIN_MARKER_WAIT, &mut handle).await {
                            Ok(joined) => joined,
                            Err(_elapsed) => {
                                let _ = task.stop.send(kind);
                                warn!(token = %task.token, "input channel forced closed");
                                handle.await
                            }
                        };
                    match joined {
                        Ok(Ok(result)) => {
                            if kind == DrainKind::Intermediate && !result.leftover.is_empty() {
                                channel_leftovers
                                    .entry(task.token)
                                    .or_default()
                                    .extend(result.leftover);
                            }
                        }
                        Ok(Err(err)) => self.record_crash(err.to_string()),
                        Err(join) => {
                            self.record_crash(format!("channel task panicked: {join}"));
                        }
                    }
                }
            }
        }

        // 4. Ring residue (the oldest items on each token), then the
        // channel leftovers behind it.
        if kind == DrainKind::Intermediate {
            for (token, handle) in &state.rings {
                data.add_items(*token, handle.drain_remaining());
            }
            for (token, leftover) in channel_leftovers {
                data.add_items(token, leftover);
            }
            // Output frames the embedder never consumed.
            for (token, tap) in &mut state.output_taps {
                loop {
                    match tokio::time::timeout(Duration::from_millis(1), tap.receive()).await {
                        Ok(Ok(Frame::Item(item))) => data.add_items(*token, vec![item]),
                        _ => break,
                    }
                }
            }
        }

        let crashed = self.crashed.load(Ordering::Relaxed);
        let next = match (crashed, kind) {
            (true, _) => AppStatus::Error,
            (false, DrainKind::Final) => AppStatus::Stopped,
            (false, DrainKind::Intermediate) => AppStatus::Reconfiguring,
        };
        if kind == DrainKind::Intermediate && !crashed {
            self.carryover = data.clone();
        }
        self.emitter.emit(ExecEvent::coordinator(format!(
            "drain complete: {} leftover items",
            data.total_items()
        )));
        self.set_status(next);
        Ok(data)
    }

    fn record_crash(&self, reason: String) {
        warn!(%reason, "work unit failure recorded");
        self.crashed.store(true, Ordering::Relaxed);
        let mut slot = self.crash_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }
}

/// Drive one core: the priming portion once, then steady steps until
/// stopped (and flushed) or crashed.
fn spawn_core(
    mut code: crate::exec::work_unit::CoreCode,
    stop: Arc<AtomicBool>,
    crashed: Arc<AtomicBool>,
    crash_reason: Arc<Mutex<Option<String>>>,
    emitter: EventEmitter,
    group: GroupId,
) -> JoinHandle<Result<(), WorkUnitError>> {
    tokio::spawn(async move {
        let fail = |err: &WorkUnitError| {
            crashed.store(true, Ordering::Relaxed);
            let mut slot = crash_reason.lock();
            if slot.is_none() {
                *slot = Some(err.to_string());
            }
            emitter.emit(ExecEvent::work_unit(group, format!("crashed: {err}")));
        };
        if let Err(err) = code.run_init() {
            fail(&err);
            return Err(err);
        }
        loop {
            if crashed.load(Ordering::Relaxed) {
                // Another core crashed; drain completion must not wait on us.
                return Ok(());
            }
            let stopping = stop.load(Ordering::Relaxed);
            match code.step() {
                Ok(Step::Ran) => tokio::task::yield_now().await,
                Ok(Step::Idle) => {
                    if stopping {
                        return Ok(());
                    }
                    tokio::time::sleep(IDLE_WAIT).await;
                }
                Err(err) => {
                    fail(&err);
                    return Err(err);
                }
            }
        }
    })
}
