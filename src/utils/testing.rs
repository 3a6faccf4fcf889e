//! Test support: shared graph builders and a scripted work-unit factory.
//!
//! The integration suite builds small well-known topologies repeatedly;
//! the builders here keep those definitions in one place. [`InterpFactory`]
//! is a single-core interpreting [`WorkUnit`] backend: each actor runs a
//! registered kernel closure (default: pass-through), so end-to-end tests
//! can execute compiled plans without a codegen backend.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::compile::CompiledPlan;
use crate::exec::work_unit::{
    BufferHandle, CoreCode, DrainData, DrainKind, Step, WorkUnit, WorkUnitError, WorkUnitFactory,
};
use crate::graph::{ActorDecl, StreamGraph, StreamGraphBuilder};
use crate::rate::{InputRate, Rate};
use crate::types::{ActorId, GroupId, Item, Token};

/// `source(push 2) -> downsample(pop 2, push 1) -> sink(pop 1)`, fed from
/// the overall input and draining to the overall output.
///
/// The balance solution is `[1, 1, 1]` internally per group once fused and
/// `source:1, downsample:1, sink:1` unfused (2 in, 1 out per iteration at
/// the downsample).
pub fn three_stage_pipeline() -> (StreamGraph, [ActorId; 3]) {
    let mut b = StreamGraphBuilder::new();
    let source = b.add_actor(ActorDecl::filter(
        "source",
        InputRate::popping(1),
        Rate::fixed(2),
    ));
    let downsample = b.add_actor(ActorDecl::filter(
        "downsample",
        InputRate::popping(2),
        Rate::fixed(1),
    ));
    let sink = b.add_actor(ActorDecl::filter(
        "sink",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    b.connect_input(Token::OverallInput, (source, 0)).unwrap();
    b.connect((source, 0), (downsample, 0)).unwrap();
    b.connect((downsample, 0), (sink, 0)).unwrap();
    b.connect_output((sink, 0), Token::OverallOutput).unwrap();
    (b.build().unwrap(), [source, downsample, sink])
}

/// A round-robin split: `split(pop 2, push 1+1)` feeding two unit-rate
/// branches that merge in `join(pop 1+1, push 2)`.
pub fn split_join_graph() -> (StreamGraph, [ActorId; 4]) {
    let mut b = StreamGraphBuilder::new();
    let split = b.add_actor(
        ActorDecl::new("split")
            .input(InputRate::popping(2))
            .output(Rate::fixed(1))
            .output(Rate::fixed(1)),
    );
    let left = b.add_actor(ActorDecl::filter(
        "left",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    let right = b.add_actor(ActorDecl::filter(
        "right",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    let join = b.add_actor(
        ActorDecl::new("join")
            .input(InputRate::popping(1))
            .input(InputRate::popping(1))
            .output(Rate::fixed(2)),
    );
    b.connect_input(Token::OverallInput, (split, 0)).unwrap();
    b.connect((split, 0), (left, 0)).unwrap();
    b.connect((split, 1), (right, 0)).unwrap();
    b.connect((left, 0), (join, 0)).unwrap();
    b.connect((right, 0), (join, 1)).unwrap();
    b.connect_output((join, 0), Token::OverallOutput).unwrap();
    (b.build().unwrap(), [split, left, right, join])
}

/// A peeking moving-average stage between two unit-rate filters: the middle
/// actor pops 1 but examines a window of 3.
pub fn peeking_pipeline() -> (StreamGraph, [ActorId; 3]) {
    let mut b = StreamGraphBuilder::new();
    let pre = b.add_actor(ActorDecl::filter(
        "pre",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    let avg = b.add_actor(ActorDecl::filter(
        "avg",
        InputRate::peeking(1, 3),
        Rate::fixed(1),
    ));
    let post = b.add_actor(ActorDecl::filter(
        "post",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    b.connect_input(Token::OverallInput, (pre, 0)).unwrap();
    b.connect((pre, 0), (avg, 0)).unwrap();
    b.connect((avg, 0), (post, 0)).unwrap();
    b.connect_output((post, 0), Token::OverallOutput).unwrap();
    (b.build().unwrap(), [pre, avg, post])
}

/// An actor kernel: consumed items in, produced items out (concatenated in
/// output-port order). Errors crash the work unit.
pub type Kernel = Arc<dyn Fn(Vec<Item>) -> Result<Vec<Item>, String> + Send + Sync>;

/// Wrap a plain infallible function as a [`Kernel`].
pub fn kernel(f: impl Fn(Vec<Item>) -> Vec<Item> + Send + Sync + 'static) -> Kernel {
    Arc::new(move |items| Ok(f(items)))
}

/// A kernel that fails on its `nth` invocation (counted from 0), for crash
/// path tests.
pub fn failing_kernel(nth: u64, reason: &str) -> Kernel {
    let reason = reason.to_string();
    let count = Arc::new(Mutex::new(0u64));
    Arc::new(move |items| {
        let mut c = count.lock();
        let n = *c;
        *c += 1;
        if n == nth {
            Err(reason.clone())
        } else {
            Ok(items)
        }
    })
}

/// Builds single-core interpreting work units from a compiled plan.
///
/// Actors without a registered kernel pass their popped items through,
/// cycled or truncated to match the declared output count.
#[derive(Clone, Default)]
pub struct InterpFactory {
    kernels: FxHashMap<ActorId, Kernel>,
}

impl InterpFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel for one actor.
    #[must_use]
    pub fn with_kernel(mut self, actor: ActorId, kernel: Kernel) -> Self {
        self.kernels.insert(actor, kernel);
        self
    }
}

impl WorkUnitFactory for InterpFactory {
    fn build(
        &self,
        plan: &CompiledPlan,
        group: GroupId,
    ) -> Result<Box<dyn WorkUnit>, WorkUnitError> {
        Ok(Box::new(InterpUnit::from_plan(plan, group, &self.kernels)))
    }
}

/// Where a port reads from or writes to.
#[derive(Clone, Copy, Debug)]
enum Port {
    /// A buffer installed by token.
    External(Token),
    /// A group-internal queue (index into the unit's locals).
    Internal(usize),
}

#[derive(Clone)]
struct ActorScript {
    id: ActorId,
    firings: u64,
    kernel: Option<Kernel>,
    /// (source, pop, peek) per input port.
    inputs: Vec<(Port, u64, u64)>,
    /// (sink, push) per output port.
    outputs: Vec<(Port, u64)>,
}

/// Single-core interpreter for one fused group. Firing a group runs every
/// member, in intra-group topological order, its scheduled number of times.
struct InterpUnit {
    group: GroupId,
    script: Vec<ActorScript>,
    /// Token addressing each local queue, for drain residue reporting.
    local_tokens: Vec<Token>,
    tokens: BTreeSet<Token>,
    shared: Arc<Mutex<InterpState>>,
}

struct InterpState {
    buffers: FxHashMap<Token, BufferHandle>,
    locals: Vec<VecDeque<Item>>,
    fired: FxHashMap<ActorId, u64>,
}

impl InterpUnit {
    fn from_plan(
        plan: &CompiledPlan,
        group: GroupId,
        kernels: &FxHashMap<ActorId, Kernel>,
    ) -> Self {
        let graph = plan.graph();
        let groups = plan.groups();
        let members = member_topo_order(plan, group);

        // Internal storages become local queues, addressed by their token
        // for drain residue reporting.
        let mut local_index: FxHashMap<crate::types::StorageId, usize> = FxHashMap::default();
        let mut local_tokens: Vec<Token> = Vec::new();
        let mut tokens = BTreeSet::new();
        let mut script = Vec::with_capacity(members.len());
        for actor in members {
            let Ok(a) = graph.actor(actor) else { continue };
            let firings = groups
                .group(group)
                .map(|g| g.firings_of(actor))
                .unwrap_or(0);
            let intern = |storage: &crate::graph::Storage,
                          local_index: &mut FxHashMap<crate::types::StorageId, usize>,
                          local_tokens: &mut Vec<Token>| {
                match local_index.get(&storage.id()) {
                    Some(idx) => *idx,
                    None => {
                        let idx = local_index.len();
                        local_index.insert(storage.id(), idx);
                        // Internal edges have actors on both sides, so a
                        // token always exists.
                        local_tokens.push(storage.token().unwrap_or(Token::OverallInput));
                        idx
                    }
                }
            };
            let mut inputs = Vec::new();
            for port in a.inputs() {
                let Ok(storage) = graph.storage(port.storage) else {
                    continue;
                };
                let pop = port.rate.pop.as_fixed().unwrap_or(0);
                let peek = port.rate.peek.as_fixed().unwrap_or(pop);
                let src = if graph.is_internal(storage, groups) {
                    Port::Internal(intern(storage, &mut local_index, &mut local_tokens))
                } else if let Some(token) = storage.token() {
                    tokens.insert(token);
                    Port::External(token)
                } else {
                    continue;
                };
                inputs.push((src, pop, peek));
            }
            let mut outputs = Vec::new();
            for port in a.outputs() {
                let Ok(storage) = graph.storage(port.storage) else {
                    continue;
                };
                let push = port.rate.as_fixed().unwrap_or(0);
                let dst = if graph.is_internal(storage, groups) {
                    Port::Internal(intern(storage, &mut local_index, &mut local_tokens))
                } else if let Some(token) = storage.token() {
                    tokens.insert(token);
                    Port::External(token)
                } else {
                    continue;
                };
                outputs.push((dst, push));
            }
            script.push(ActorScript {
                id: actor,
                firings,
                kernel: kernels.get(&actor).cloned(),
                inputs,
                outputs,
            });
        }

        let locals = local_index.len();
        Self {
            group,
            script,
            local_tokens,
            tokens,
            shared: Arc::new(Mutex::new(InterpState {
                buffers: FxHashMap::default(),
                locals: (0..locals).map(|_| VecDeque::new()).collect(),
                fired: FxHashMap::default(),
            })),
        }
    }

    /// Whether one full group firing can run right now: every external
    /// input holds a full window, every external output has space.
    fn feasible(script: &[ActorScript], state: &InterpState) -> bool {
        for actor in script {
            for (src, pop, peek) in &actor.inputs {
                if let Port::External(token) = src {
                    let Some(buffer) = state.buffers.get(token) else {
                        return false;
                    };
                    let needed = pop * actor.firings + peek.saturating_sub(*pop);
                    if (buffer.len() as u64) < needed {
                        return false;
                    }
                }
            }
            for (dst, push) in &actor.outputs {
                if let Port::External(token) = dst {
                    let Some(buffer) = state.buffers.get(token) else {
                        return false;
                    };
                    if (buffer.free() as u64) < push * actor.firings {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn fire_group(
        group: GroupId,
        script: &[ActorScript],
        state: &mut InterpState,
    ) -> Result<(), WorkUnitError> {
        for actor in script {
            for _ in 0..actor.firings {
                let mut consumed = Vec::new();
                for (src, pop, _) in &actor.inputs {
                    for _ in 0..*pop {
                        let item = match src {
                            Port::External(token) => {
                                state.buffers.get(token).and_then(BufferHandle::pop)
                            }
                            Port::Internal(idx) => state.locals[*idx].pop_front(),
                        };
                        match item {
                            Some(item) => consumed.push(item),
                            // Feasibility was checked; an empty source here
                            // means the schedule is wrong.
                            None => {
                                return Err(WorkUnitError::Crashed {
                                    group,
                                    reason: format!("underflow firing {}", actor.id),
                                });
                            }
                        }
                    }
                }
                let produced = match &actor.kernel {
                    Some(kernel) => kernel(consumed).map_err(|reason| {
                        WorkUnitError::Crashed { group, reason }
                    })?,
                    None => consumed,
                };
                let total_out: u64 = actor.outputs.iter().map(|(_, push)| *push).sum();
                let outputs = fit_to(produced, total_out as usize);
                let mut cursor = 0usize;
                for (dst, push) in &actor.outputs {
                    for _ in 0..*push {
                        let item = outputs[cursor].clone();
                        cursor += 1;
                        match dst {
                            Port::External(token) => {
                                if let Some(buffer) = state.buffers.get(token) {
                                    buffer.push(item)?;
                                }
                            }
                            Port::Internal(idx) => state.locals[*idx].push_back(item),
                        }
                    }
                }
                *state.fired.entry(actor.id).or_insert(0) += 1;
            }
        }
        Ok(())
    }
}

/// Cycle or pad `items` to exactly `len` elements.
fn fit_to(mut items: Vec<Item>, len: usize) -> Vec<Item> {
    if items.is_empty() {
        return vec![Item::I64(0); len];
    }
    let base = items.len();
    while items.len() < len {
        let next = items[items.len() % base].clone();
        items.push(next);
    }
    items.truncate(len);
    items
}

impl WorkUnit for InterpUnit {
    fn group(&self) -> GroupId {
        self.group
    }

    fn tokens(&self) -> BTreeSet<Token> {
        self.tokens.clone()
    }

    fn install_buffers(
        &mut self,
        buffers: FxHashMap<Token, BufferHandle>,
    ) -> Result<(), WorkUnitError> {
        for token in &self.tokens {
            if !buffers.contains_key(token) {
                return Err(WorkUnitError::MissingBuffer {
                    group: self.group,
                    token: *token,
                });
            }
        }
        self.shared.lock().buffers = buffers;
        Ok(())
    }

    fn core_count(&self) -> usize {
        1
    }

    fn core_code(&mut self, core: usize) -> Result<CoreCode, WorkUnitError> {
        if core != 0 {
            return Err(WorkUnitError::NoSuchCore {
                group: self.group,
                core,
                count: 1,
            });
        }
        let group = self.group;
        let script = self.script.clone();
        let shared = Arc::clone(&self.shared);
        // Priming and steady firings are identical for an interpreter, so
        // init is a no-op and the steady step waits for input on its own.
        Ok(CoreCode::new(
            || Ok(()),
            move || {
                let mut state = shared.lock();
                if !InterpUnit::feasible(&script, &state) {
                    return Ok(Step::Idle);
                }
                InterpUnit::fire_group(group, &script, &mut state)?;
                Ok(Step::Ran)
            },
        ))
    }

    fn min_buffer_capacity(&self, token: Token) -> usize {
        let mut needed = 0u64;
        for actor in &self.script {
            for (src, pop, peek) in &actor.inputs {
                if matches!(src, Port::External(t) if *t == token) {
                    needed = needed.max(pop * actor.firings + peek.saturating_sub(*pop));
                }
            }
            for (dst, push) in &actor.outputs {
                if matches!(dst, Port::External(t) if *t == token) {
                    needed = needed.max(push * actor.firings);
                }
            }
        }
        usize::try_from(needed).unwrap_or(usize::MAX)
    }

    fn drain(&mut self, _kind: DrainKind) {}

    fn drain_data(&mut self) -> DrainData {
        let state = self.shared.lock();
        let mut data = DrainData::new();
        for (actor, fired) in &state.fired {
            data.set_state(*actor, serde_json::json!({ "fired": fired }));
        }
        // Local queues are invisible to the coordinator's ring collection,
        // so residue on internal edges is reported here. Internal edges of
        // a correct schedule are empty between group firings.
        for (idx, queue) in state.locals.iter().enumerate() {
            if !queue.is_empty() {
                data.add_items(self.local_tokens[idx], queue.iter().cloned().collect());
            }
        }
        data
    }
}

/// Members of `group` in intra-group topological order (Kahn over the
/// group-internal storages, ties broken by ascending id).
fn member_topo_order(plan: &CompiledPlan, group: GroupId) -> Vec<ActorId> {
    let graph = plan.graph();
    let groups = plan.groups();
    let members: BTreeSet<ActorId> = groups
        .group(group)
        .map(|g| g.actors().clone())
        .unwrap_or_default();

    let mut indegree: FxHashMap<ActorId, usize> = members.iter().map(|a| (*a, 0)).collect();
    let mut edges: FxHashMap<ActorId, Vec<ActorId>> = FxHashMap::default();
    for &actor in &members {
        let Ok(a) = graph.actor(actor) else { continue };
        for port in a.outputs() {
            let Ok(storage) = graph.storage(port.storage) else {
                continue;
            };
            if !graph.is_internal(storage, groups) {
                continue;
            }
            if let Some(downstream) = storage.downstream_actor() {
                if members.contains(&downstream) {
                    edges.entry(actor).or_default().push(downstream);
                    if let Some(d) = indegree.get_mut(&downstream) {
                        *d += 1;
                    }
                }
            }
        }
    }
    let mut ready: BTreeSet<ActorId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(a, _)| *a)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for succ in edges.get(&next).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(succ) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*succ);
                }
            }
        }
    }
    order
}
