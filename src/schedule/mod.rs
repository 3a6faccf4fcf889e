//! Steady-state and initialization scheduling.
//!
//! [`solver`] computes minimal positive integer firing multiplicities from
//! per-edge rate balance equations (the classical synchronous-dataflow
//! balance system). It is invoked twice per compilation: once per actor
//! group (internal schedule) and once globally over the group graph
//! (external schedule, with edge rates scaled by internal multiplicities).
//!
//! [`init`] computes the priming phase: how many extra firings each group
//! needs before steady-state cycling so that every downstream peek/pop
//! window is already covered.

pub mod init;
pub mod solver;

pub use init::{InitSchedule, MAX_INIT_FIRINGS};
pub use solver::{Schedule, ScheduleBuilder, ScheduleError};
