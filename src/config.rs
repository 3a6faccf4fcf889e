//! Tunable configuration parameters.
//!
//! A [`Configuration`] is an immutable flat map from parameter name to typed
//! value, supplied by an external tuning loop. The compilation core reads
//! parameters by name and type (fusion switches per group, buffer
//! multipliers per machine, connection type per edge) but never defines or
//! mutates the search itself.
//!
//! # Examples
//!
//! ```rust
//! use streamfuse::config::{Configuration, ConnectionKind};
//! use streamfuse::types::{GroupId, MachineId};
//!
//! let config = Configuration::builder()
//!     .with_fuse(GroupId(1), false)
//!     .with_multiplier(MachineId(0), 16)
//!     .build();
//!
//! assert_eq!(config.fuse(GroupId(1)), false);
//! assert_eq!(config.fuse(GroupId(2)), true); // absent switches default on
//! assert_eq!(config.multiplier(MachineId(0)), 16);
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::{GroupId, MachineId, Token};

/// Default buffer multiplier applied when a machine has no tuned value.
pub const DEFAULT_MULTIPLIER: u64 = 1;

/// A typed tunable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    /// Enumerated switch, stored by variant name.
    Switch(String),
}

/// Connection type for one boundary edge, selectable per token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionKind {
    /// Blocking in-order transport (the only kind the core itself provides).
    #[default]
    Blocking,
    /// Asynchronous transport with internal buffering.
    Async,
}

/// An immutable named-parameter map from the tuning loop.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    params: FxHashMap<String, ParamValue>,
}

impl Configuration {
    #[must_use]
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Raw lookup by parameter name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.params.get(name)? {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.params.get(name)? {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_switch(&self, name: &str) -> Option<&str> {
        match self.params.get(name)? {
            ParamValue::Switch(s) => Some(s),
            _ => None,
        }
    }

    /// The fusion switch for a group.
    ///
    /// An absent switch means "fuse greedily": the tuner only emits switches
    /// for groups it has explored, and the default keeps untuned graphs
    /// maximally fused.
    #[must_use]
    pub fn fuse(&self, group: GroupId) -> bool {
        self.get_bool(&format!("fuse{}", group.0)).unwrap_or(true)
    }

    /// The buffer capacity multiplier for a machine.
    #[must_use]
    pub fn multiplier(&self, machine: MachineId) -> u64 {
        self.get_int(&format!("multiplier{}", machine.0))
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MULTIPLIER)
    }

    /// The connection kind for a boundary edge.
    #[must_use]
    pub fn connection(&self, token: Token) -> ConnectionKind {
        match self.get_switch(&format!("conn:{}", token.encode())) {
            Some("async") => ConnectionKind::Async,
            _ => ConnectionKind::Blocking,
        }
    }

    /// Number of parameters in this configuration.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Builder for [`Configuration`] with typed insertion helpers.
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    params: FxHashMap<String, ParamValue>,
}

impl ConfigurationBuilder {
    #[must_use]
    pub fn with_bool(mut self, name: impl Into<String>, value: bool) -> Self {
        self.params.insert(name.into(), ParamValue::Bool(value));
        self
    }

    #[must_use]
    pub fn with_int(mut self, name: impl Into<String>, value: i64) -> Self {
        self.params.insert(name.into(), ParamValue::Int(value));
        self
    }

    #[must_use]
    pub fn with_switch(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), ParamValue::Switch(value.into()));
        self
    }

    /// Set the fusion switch for a group.
    #[must_use]
    pub fn with_fuse(self, group: GroupId, fuse: bool) -> Self {
        self.with_bool(format!("fuse{}", group.0), fuse)
    }

    /// Set the buffer multiplier for a machine.
    #[must_use]
    pub fn with_multiplier(self, machine: MachineId, multiplier: u64) -> Self {
        self.with_int(
            format!("multiplier{}", machine.0),
            i64::try_from(multiplier).unwrap_or(i64::MAX),
        )
    }

    /// Set the connection kind for a boundary edge.
    #[must_use]
    pub fn with_connection(self, token: Token, kind: ConnectionKind) -> Self {
        let value = match kind {
            ConnectionKind::Blocking => "blocking",
            ConnectionKind::Async => "async",
        };
        self.with_switch(format!("conn:{}", token.encode()), value)
    }

    #[must_use]
    pub fn build(self) -> Configuration {
        Configuration {
            params: self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorId;

    #[test]
    fn typed_accessors() {
        let config = Configuration::builder()
            .with_bool("flag", true)
            .with_int("count", 7)
            .with_switch("mode", "fast")
            .build();
        assert_eq!(config.get_bool("flag"), Some(true));
        assert_eq!(config.get_int("count"), Some(7));
        assert_eq!(config.get_switch("mode"), Some("fast"));
        // Type mismatches read as absent, not panics.
        assert_eq!(config.get_bool("count"), None);
        assert_eq!(config.get_int("missing"), None);
    }

    #[test]
    fn domain_defaults() {
        let config = Configuration::default();
        assert!(config.fuse(GroupId(0)));
        assert_eq!(config.multiplier(MachineId(3)), DEFAULT_MULTIPLIER);
        assert_eq!(
            config.connection(Token::Between(ActorId(0), ActorId(1))),
            ConnectionKind::Blocking
        );
    }

    #[test]
    fn serde_round_trip() {
        let config = Configuration::builder()
            .with_fuse(GroupId(2), false)
            .with_multiplier(MachineId(1), 4)
            .build();
        let json = serde_json::to_string(&config).unwrap();
        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fuse(GroupId(2)), false);
        assert_eq!(back.multiplier(MachineId(1)), 4);
    }
}
