//! Execution event bus.
//!
//! Runtime components (coordinator, machines, boundary channels, work
//! units) emit structured [`ExecEvent`]s over a flume channel so embedders
//! can observe lifecycle transitions and drain progress without parsing
//! logs. Emission never blocks and never fails the emitter: a bus with no
//! listener silently drops events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{GroupId, MachineId, Token};

/// Where an event originated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecScope {
    /// The application-level coordinator.
    Coordinator,
    /// One machine's local runtime.
    Machine { machine: MachineId },
    /// A boundary channel, keyed by its edge token.
    Channel { token: Token },
    /// One compiled work unit.
    WorkUnit { group: GroupId },
}

impl fmt::Display for ExecScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecScope::Coordinator => write!(f, "coordinator"),
            ExecScope::Machine { machine } => write!(f, "machine:{machine}"),
            ExecScope::Channel { token } => write!(f, "channel:{token}"),
            ExecScope::WorkUnit { group } => write!(f, "unit:{group}"),
        }
    }
}

/// A structured runtime event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEvent {
    pub when: DateTime<Utc>,
    pub scope: ExecScope,
    pub message: String,
}

impl ExecEvent {
    pub fn coordinator(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ExecScope::Coordinator,
            message: message.into(),
        }
    }

    pub fn machine(machine: MachineId, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ExecScope::Machine { machine },
            message: message.into(),
        }
    }

    pub fn channel(token: Token, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ExecScope::Channel { token },
            message: message.into(),
        }
    }

    pub fn work_unit(group: GroupId, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            scope: ExecScope::WorkUnit { group },
            message: message.into(),
        }
    }
}

/// Clonable emitter handle held by runtime components.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sender: flume::Sender<ExecEvent>,
}

impl EventEmitter {
    /// Emit one event; drops silently when no bus is listening.
    pub fn emit(&self, event: ExecEvent) {
        let _ = self.sender.send(event);
    }

    /// An emitter wired to nothing, for components run without a bus.
    #[must_use]
    pub fn disconnected() -> Self {
        let (sender, _) = flume::unbounded();
        Self { sender }
    }
}

/// Receives events from every emitter handed out by [`emitter`](Self::emitter).
pub struct EventBus {
    sender: flume::Sender<ExecEvent>,
    receiver: flume::Receiver<ExecEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    /// A new emitter handle for a runtime component.
    #[must_use]
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            sender: self.sender.clone(),
        }
    }

    /// A receiver for streaming consumption.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<ExecEvent> {
        self.receiver.clone()
    }

    /// Drain everything currently queued (non-blocking).
    #[must_use]
    pub fn collect(&self) -> Vec<ExecEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_flow_to_collector() {
        let bus = EventBus::new();
        let emitter = bus.emitter();
        emitter.emit(ExecEvent::coordinator("compiling"));
        emitter.emit(ExecEvent::machine(MachineId(1), "started"));
        let events = bus.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].scope, ExecScope::Coordinator);
        assert_eq!(events[1].message, "started");
    }

    #[test]
    fn disconnected_emitter_never_errors() {
        let emitter = EventEmitter::disconnected();
        emitter.emit(ExecEvent::coordinator("dropped"));
    }
}
