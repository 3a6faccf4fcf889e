//! # Streamfuse: Stream-Graph Compilation & Scheduling Core
//!
//! Streamfuse compiles a graph of rate-annotated, data-parallel actors into
//! an executable plan (fused actor groups, steady-state and initialization
//! schedules, sized circular buffers) and coordinates distributed
//! execution with a drain/reconfigure protocol across machine boundaries.
//!
//! ## Core Concepts
//!
//! - **Actors**: computation nodes with declared per-port push/pop/peek rates
//! - **Storages**: the typed edges between actor (or boundary) endpoints
//! - **Groups**: fused sets of actors executing as one schedulable unit
//! - **Schedules**: minimal integer firing multiplicities solved from the
//!   per-edge balance equations, plus a priming (init) schedule
//! - **Tokens**: stable boundary-edge identifiers that survive group
//!   restructuring and key all cross-machine addressing
//! - **Coordinator**: the lifecycle state machine driving compiled plans,
//!   including intermediate drains that carry in-flight data into the next
//!   configuration
//!
//! ## Quick Start
//!
//! ### Building and compiling a pipeline
//!
//! ```
//! use streamfuse::compile::compile;
//! use streamfuse::config::Configuration;
//! use streamfuse::graph::{ActorDecl, StreamGraphBuilder};
//! use streamfuse::rate::{InputRate, Rate};
//! use streamfuse::types::Token;
//!
//! let mut b = StreamGraphBuilder::new();
//! let expand = b.add_actor(ActorDecl::filter(
//!     "expand",
//!     InputRate::popping(1),
//!     Rate::fixed(2),
//! ));
//! let reduce = b.add_actor(ActorDecl::filter(
//!     "reduce",
//!     InputRate::popping(2),
//!     Rate::fixed(1),
//! ));
//! b.connect_input(Token::OverallInput, (expand, 0)).unwrap();
//! b.connect((expand, 0), (reduce, 0)).unwrap();
//! b.connect_output((reduce, 0), Token::OverallOutput).unwrap();
//! let graph = b.build().unwrap();
//!
//! let plan = compile(graph, &Configuration::builder().build()).unwrap();
//! // With default switches the whole chain fuses into one group.
//! assert_eq!(plan.groups().len(), 1);
//! ```
//!
//! ### Steering compilation with a configuration
//!
//! The (out of scope) autotuner proposes [`config::Configuration`] values;
//! the compiler only reads them. Switch `fuse<N>` off to keep group `N`
//! separate, or raise a machine's `multiplier<M>` to give its buffers more
//! steady-state headroom:
//!
//! ```
//! use streamfuse::config::Configuration;
//! use streamfuse::types::GroupId;
//!
//! let config = Configuration::builder()
//!     .with_fuse(GroupId(1), false)
//!     .build();
//! assert!(!config.fuse(GroupId(1)));
//! assert!(config.fuse(GroupId(0))); // absent switches default on
//! ```
//!
//! ## Execution
//!
//! Executing a plan is the [`exec`] module's business: implement
//! [`exec::WorkUnitFactory`] (the seam where a codegen backend plugs in),
//! hand it to an [`exec::Coordinator`], and drive the lifecycle
//! `start -> drain`. [`utils::testing::InterpFactory`] provides an
//! interpreting backend good enough for tests and small pipelines.

pub mod buffers;
pub mod compile;
pub mod config;
pub mod events;
pub mod exec;
pub mod fusion;
pub mod graph;
pub mod rate;
pub mod schedule;
pub mod types;
pub mod utils;
