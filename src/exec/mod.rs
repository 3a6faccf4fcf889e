//! Execution: work units, boundary channels, and the app coordinator.
//!
//! Compilation produces a [`CompiledPlan`](crate::compile::CompiledPlan);
//! execution turns each fused group into an opaque [`WorkUnit`], wires
//! cross-boundary storages through [`channel`]s keyed by
//! [`Token`](crate::types::Token), and drives the whole application through
//! the [`coordinator`] lifecycle state machine, including the
//! drain/reconfigure protocol.

pub mod channel;
pub mod coordinator;
pub mod work_unit;

pub use channel::{
    BoundaryInputChannel, BoundaryOutputChannel, Channel, ChannelError, FlumeChannel, Frame,
    InputOutcome,
};
pub use coordinator::{AppStatus, Coordinator, RunError};
pub use work_unit::{
    BufferHandle, CoreCode, DrainData, DrainKind, Step, WorkUnit, WorkUnitError, WorkUnitFactory,
};
