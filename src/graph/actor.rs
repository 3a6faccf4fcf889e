//! Actor: a single computation node with declared per-port rates.

use serde::{Deserialize, Serialize};

use crate::rate::{InputRate, Rate};
use crate::types::{ActorId, ElementType, StorageId};

/// Declaration of an actor before it is added to a graph.
///
/// Splitters and joiners are ordinary actors with several output or input
/// ports; a plain filter has one of each. Element types drive the unboxing
/// pass: a storage narrows to a primitive representation only when every
/// connected actor's facing type agrees and the actor opts in.
///
/// # Examples
///
/// ```rust
/// use streamfuse::graph::ActorDecl;
/// use streamfuse::rate::{InputRate, Rate};
///
/// // A round-robin splitter: pops 2, pushes 1 to each of two branches.
/// let decl = ActorDecl::new("split")
///     .input(InputRate::popping(2))
///     .output(Rate::fixed(1))
///     .output(Rate::fixed(1));
/// ```
#[derive(Clone, Debug)]
pub struct ActorDecl {
    pub(crate) name: String,
    pub(crate) inputs: Vec<InputRate>,
    pub(crate) outputs: Vec<Rate>,
    pub(crate) input_type: ElementType,
    pub(crate) output_type: ElementType,
    pub(crate) unboxable: bool,
}

impl ActorDecl {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_type: ElementType::Any,
            output_type: ElementType::Any,
            unboxable: true,
        }
    }

    /// A single-input single-output filter.
    #[must_use]
    pub fn filter(name: impl Into<String>, input: InputRate, output: Rate) -> Self {
        Self::new(name).input(input).output(output)
    }

    /// Append an input port.
    #[must_use]
    pub fn input(mut self, rate: InputRate) -> Self {
        self.inputs.push(rate);
        self
    }

    /// Append an output port.
    #[must_use]
    pub fn output(mut self, rate: Rate) -> Self {
        self.outputs.push(rate);
        self
    }

    /// Declare the element types this actor consumes and produces.
    #[must_use]
    pub fn typed(mut self, input: ElementType, output: ElementType) -> Self {
        self.input_type = input;
        self.output_type = output;
        self
    }

    /// Opt out of unboxed buffer representations for adjacent storages.
    #[must_use]
    pub fn boxed_only(mut self) -> Self {
        self.unboxable = false;
        self
    }
}

/// One connected input port of a built actor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputPort {
    pub rate: InputRate,
    pub storage: StorageId,
}

/// One connected output port of a built actor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputPort {
    pub rate: Rate,
    pub storage: StorageId,
}

/// A single computation node in a built [`StreamGraph`](crate::graph::StreamGraph).
///
/// Identity is immutable after graph ingestion. Group membership lives in
/// the [`GroupArena`](crate::graph::GroupArena), never on the actor.
#[derive(Clone, Debug)]
pub struct Actor {
    id: ActorId,
    name: String,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    input_type: ElementType,
    output_type: ElementType,
    unboxable: bool,
}

impl Actor {
    pub(crate) fn new(
        id: ActorId,
        decl: &ActorDecl,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) -> Self {
        Self {
            id,
            name: decl.name.clone(),
            inputs,
            outputs,
            input_type: decl.input_type,
            output_type: decl.output_type,
            unboxable: decl.unboxable,
        }
    }

    #[must_use]
    pub fn id(&self) -> ActorId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered input ports with their connected storages.
    #[must_use]
    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    /// Ordered output ports with their connected storages.
    #[must_use]
    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    /// The input port connected to `storage`, if any.
    #[must_use]
    pub fn input_on(&self, storage: StorageId) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.storage == storage)
    }

    /// The output port connected to `storage`, if any.
    #[must_use]
    pub fn output_on(&self, storage: StorageId) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.storage == storage)
    }

    /// Returns `true` when every port rate is fixed.
    #[must_use]
    pub fn rates_fixed(&self) -> bool {
        self.inputs.iter().all(|p| p.rate.is_fixed())
            && self.outputs.iter().all(|p| p.rate.is_fixed())
    }

    /// Returns `true` if any input examines items beyond what it consumes.
    #[must_use]
    pub fn is_peeking(&self) -> bool {
        self.inputs.iter().any(|p| p.rate.is_peeking())
    }

    #[must_use]
    pub fn input_type(&self) -> ElementType {
        self.input_type
    }

    #[must_use]
    pub fn output_type(&self) -> ElementType {
        self.output_type
    }

    /// Whether adjacent storages may use unboxed primitive buffers.
    #[must_use]
    pub fn unboxable(&self) -> bool {
        self.unboxable
    }
}
