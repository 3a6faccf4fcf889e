//! The rate/schedule solver: minimal firing multiplicities from balance
//! equations.
//!
//! Given a set of nodes and, for each ordered pair connected by an edge, a
//! `(push, pop, peek)` fixed-rate triple, the solver computes the minimal
//! positive-integer multiplicity vector `m` such that for every edge
//! `u -> v`: `m[u] * push == m[v] * pop`. Peek rates are recorded for the
//! storage allocator but never constrain multiplicities; peeked items are
//! satisfied by the same produced items, just not consumed.
//!
//! The balance system is solved over the rationals by propagation along a
//! spanning traversal, then normalized: multiply by the LCM of denominators
//! to clear fractions, divide by the GCD of numerators for minimality.
//!
//! # Examples
//!
//! ```rust
//! use streamfuse::schedule::ScheduleBuilder;
//!
//! // A(push 2) -> B(pop 3): minimal balance is m[A]=3, m[B]=2.
//! let mut b = ScheduleBuilder::new();
//! b.connect("A", "B").push(2).pop(3);
//! let schedule = b.solve().unwrap();
//! assert_eq!(schedule.multiplicity(&"A"), 3);
//! assert_eq!(schedule.multiplicity(&"B"), 2);
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;
use tracing::trace;

/// Failure to find a valid firing multiplicity vector.
///
/// Recoverable at the configuration level: the caller rejects this
/// configuration and the tuning loop proposes another. Fatal to compiling
/// this particular configuration.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("contradictory rates on edge {upstream} -> {downstream}: no positive firing vector balances it")]
    #[diagnostic(
        code(streamfuse::schedule::inconsistent),
        help("two paths between these nodes imply different firing ratios; check the declared rates")
    )]
    Inconsistent { upstream: String, downstream: String },

    #[error("node {node} is disconnected from the balance system")]
    #[diagnostic(
        code(streamfuse::schedule::underconstrained),
        help("every scheduled node must be reachable through rate-constrained edges")
    )]
    Underconstrained { node: String },

    #[error("edge {upstream} -> {downstream} declares a zero rate (push {push}, pop {pop})")]
    #[diagnostic(code(streamfuse::schedule::zero_rate))]
    ZeroRate {
        upstream: String,
        downstream: String,
        push: u64,
        pop: u64,
    },

    #[error("firing multiplicities overflow while balancing {upstream} -> {downstream}")]
    #[diagnostic(code(streamfuse::schedule::overflow))]
    Overflow { upstream: String, downstream: String },

    #[error("no nodes to schedule")]
    #[diagnostic(code(streamfuse::schedule::empty))]
    Empty,
}

/// A solved steady-state schedule: the minimal firing-count vector.
#[derive(Clone, Debug)]
pub struct Schedule<N> {
    multiplicities: FxHashMap<N, u64>,
}

impl<N: Eq + Hash + Copy> Schedule<N> {
    /// The full multiplicity map.
    #[must_use]
    pub fn multiplicities(&self) -> &FxHashMap<N, u64> {
        &self.multiplicities
    }

    /// Firings of `node` per steady-state iteration (0 for unknown nodes).
    #[must_use]
    pub fn multiplicity(&self, node: &N) -> u64 {
        self.multiplicities.get(node).copied().unwrap_or(0)
    }
}

struct EdgeConstraint<N> {
    upstream: N,
    downstream: N,
    push: u64,
    pop: u64,
    peek: u64,
}

/// Mutating handle for one edge's rates, returned by
/// [`ScheduleBuilder::connect`].
pub struct EdgeRates<'a, N> {
    edge: &'a mut EdgeConstraint<N>,
}

impl<N> EdgeRates<'_, N> {
    pub fn push(self, items: u64) -> Self {
        self.edge.push = items;
        self
    }

    pub fn pop(self, items: u64) -> Self {
        self.edge.pop = items;
        self
    }

    pub fn peek(self, items: u64) -> Self {
        self.edge.peek = items;
        self
    }
}

/// Builder for one balance-equation system.
///
/// Generic over the node key: the compiler solves over
/// [`ActorId`](crate::types::ActorId) for internal schedules and
/// [`GroupId`](crate::types::GroupId) for the external schedule.
pub struct ScheduleBuilder<N> {
    nodes: BTreeSet<N>,
    edges: Vec<EdgeConstraint<N>>,
}

impl<N> Default for ScheduleBuilder<N>
where
    N: Copy + Ord + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N> ScheduleBuilder<N>
where
    N: Copy + Ord + Eq + Hash + Display,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeSet::new(),
            edges: Vec::new(),
        }
    }

    /// Register a node with no edge constraints (yet).
    ///
    /// A lone constraint-free node solves to multiplicity 1.
    pub fn add_node(&mut self, node: N) {
        self.nodes.insert(node);
    }

    /// Register every node of an iterator.
    pub fn add_all(&mut self, nodes: impl IntoIterator<Item = N>) {
        self.nodes.extend(nodes);
    }

    /// Declare an edge and set its rates through the returned handle.
    pub fn connect(&mut self, upstream: N, downstream: N) -> EdgeRates<'_, N> {
        self.nodes.insert(upstream);
        self.nodes.insert(downstream);
        self.edges.push(EdgeConstraint {
            upstream,
            downstream,
            push: 0,
            pop: 0,
            peek: 0,
        });
        EdgeRates {
            edge: self
                .edges
                .last_mut()
                .unwrap_or_else(|| unreachable!("edge pushed above")),
        }
    }

    /// Solve the balance system for the minimal positive integer vector.
    pub fn solve(&self) -> Result<Schedule<N>, ScheduleError> {
        if self.nodes.is_empty() {
            return Err(ScheduleError::Empty);
        }
        for e in &self.edges {
            if e.push == 0 || e.pop == 0 {
                return Err(ScheduleError::ZeroRate {
                    upstream: e.upstream.to_string(),
                    downstream: e.downstream.to_string(),
                    push: e.push,
                    pop: e.pop,
                });
            }
        }

        // Undirected adjacency: (neighbor, edge index, forward?).
        let mut adjacency: FxHashMap<N, Vec<(N, usize, bool)>> = FxHashMap::default();
        for (idx, e) in self.edges.iter().enumerate() {
            adjacency
                .entry(e.upstream)
                .or_default()
                .push((e.downstream, idx, true));
            adjacency
                .entry(e.downstream)
                .or_default()
                .push((e.upstream, idx, false));
        }

        // Propagate rational multiplicities from the smallest node.
        let root = *self
            .nodes
            .first()
            .unwrap_or_else(|| unreachable!("checked non-empty"));
        let mut ratios: FxHashMap<N, Ratio> = FxHashMap::default();
        ratios.insert(root, Ratio::ONE);
        let mut frontier = vec![root];
        while let Some(node) = frontier.pop() {
            let here = ratios[&node];
            for &(neighbor, idx, forward) in adjacency.get(&node).into_iter().flatten() {
                let e = &self.edges[idx];
                let overflow = || ScheduleError::Overflow {
                    upstream: e.upstream.to_string(),
                    downstream: e.downstream.to_string(),
                };
                // Forward edge node -> neighbor: m[nb] = m[node] * push / pop.
                // Reverse: m[nb] = m[node] * pop / push.
                let (num, den) = if forward {
                    (e.push, e.pop)
                } else {
                    (e.pop, e.push)
                };
                let implied = here.scale(num, den).ok_or_else(overflow)?;
                match ratios.get(&neighbor) {
                    None => {
                        ratios.insert(neighbor, implied);
                        frontier.push(neighbor);
                    }
                    Some(existing) if *existing == implied => {}
                    Some(_) => {
                        return Err(ScheduleError::Inconsistent {
                            upstream: e.upstream.to_string(),
                            downstream: e.downstream.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(stranded) = self.nodes.iter().find(|n| !ratios.contains_key(n)) {
            return Err(ScheduleError::Underconstrained {
                node: stranded.to_string(),
            });
        }

        // Clear fractions with the LCM of denominators, then reduce by the
        // GCD of the resulting integers for the minimal vector.
        let mut denominator_lcm: i128 = 1;
        for r in ratios.values() {
            denominator_lcm = lcm(denominator_lcm, r.den).ok_or(ScheduleError::Overflow {
                upstream: root.to_string(),
                downstream: root.to_string(),
            })?;
        }
        let mut scaled: FxHashMap<N, i128> = FxHashMap::default();
        for (node, r) in &ratios {
            let v = r
                .num
                .checked_mul(denominator_lcm / r.den)
                .ok_or(ScheduleError::Overflow {
                    upstream: node.to_string(),
                    downstream: node.to_string(),
                })?;
            scaled.insert(*node, v);
        }
        let common = scaled.values().fold(0i128, |acc, v| gcd(acc, *v));
        debug_assert!(common > 0);

        let mut multiplicities = FxHashMap::default();
        for (node, v) in scaled {
            let m = u64::try_from(v / common).map_err(|_| ScheduleError::Overflow {
                upstream: node.to_string(),
                downstream: node.to_string(),
            })?;
            multiplicities.insert(node, m);
        }
        let max_peek = self.edges.iter().map(|e| e.peek).max().unwrap_or(0);
        trace!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            max_peek,
            "balance system solved"
        );
        Ok(Schedule { multiplicities })
    }
}

/// A positive rational, always kept reduced with `den > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Ratio {
    num: i128,
    den: i128,
}

impl Ratio {
    const ONE: Ratio = Ratio { num: 1, den: 1 };

    fn scale(self, num: u64, den: u64) -> Option<Ratio> {
        let n = self.num.checked_mul(i128::from(num))?;
        let d = self.den.checked_mul(i128::from(den))?;
        let g = gcd(n, d);
        Some(Ratio {
            num: n / g,
            den: d / g,
        })
    }
}

fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

fn lcm(a: i128, b: i128) -> Option<i128> {
    (a / gcd(a, b)).checked_mul(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_node_fires_once() {
        let mut b: ScheduleBuilder<&str> = ScheduleBuilder::new();
        b.add_node("solo");
        let s = b.solve().unwrap();
        assert_eq!(s.multiplicity(&"solo"), 1);
    }

    #[test]
    fn default_builder_solves_like_new() {
        let mut b = ScheduleBuilder::<&str>::default();
        b.connect("A", "B").push(1).pop(2);
        let s = b.solve().unwrap();
        assert_eq!(s.multiplicity(&"A"), 2);
        assert_eq!(s.multiplicity(&"B"), 1);
    }

    #[test]
    fn chain_minimal_vector() {
        // A(push 2) -> B(pop 2, push 1) -> C(pop 1)
        let mut b = ScheduleBuilder::new();
        b.connect("A", "B").push(2).pop(2);
        b.connect("B", "C").push(1).pop(1);
        let s = b.solve().unwrap();
        assert_eq!(s.multiplicity(&"A"), 1);
        assert_eq!(s.multiplicity(&"B"), 1);
        assert_eq!(s.multiplicity(&"C"), 1);
    }

    #[test]
    fn fractional_ratios_normalize() {
        // A(push 3) -> B(pop 2, push 2) -> C(pop 9)
        let mut b = ScheduleBuilder::new();
        b.connect("A", "B").push(3).pop(2);
        b.connect("B", "C").push(2).pop(9);
        let s = b.solve().unwrap();
        // m[A]*3 == m[B]*2, m[B]*2 == m[C]*9 -> minimal (6, 9, 2)
        assert_eq!(s.multiplicity(&"A"), 6);
        assert_eq!(s.multiplicity(&"B"), 9);
        assert_eq!(s.multiplicity(&"C"), 2);
    }

    #[test]
    fn inconsistent_cycle_fails() {
        // A -1:1-> B -1:1-> C, but A -3:2-> C contradicts.
        let mut b = ScheduleBuilder::new();
        b.connect("A", "B").push(1).pop(1);
        b.connect("B", "C").push(1).pop(1);
        b.connect("A", "C").push(3).pop(2);
        match b.solve() {
            Err(ScheduleError::Inconsistent { .. }) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
    }

    #[test]
    fn disconnected_node_fails() {
        let mut b = ScheduleBuilder::new();
        b.connect("A", "B").push(1).pop(1);
        b.add_node("X");
        match b.solve() {
            Err(ScheduleError::Underconstrained { node }) => assert_eq!(node, "X"),
            other => panic!("expected Underconstrained, got {other:?}"),
        }
    }

    #[test]
    fn zero_rate_fails() {
        let mut b = ScheduleBuilder::new();
        b.connect("A", "B").push(0).pop(2);
        assert!(matches!(b.solve(), Err(ScheduleError::ZeroRate { .. })));
    }

    #[test]
    fn peek_does_not_constrain() {
        let mut with_peek = ScheduleBuilder::new();
        with_peek.connect("A", "B").push(1).pop(1).peek(64);
        let mut without = ScheduleBuilder::new();
        without.connect("A", "B").push(1).pop(1);
        assert_eq!(
            with_peek.solve().unwrap().multiplicity(&"B"),
            without.solve().unwrap().multiplicity(&"B"),
        );
    }
}
