//! Node functions and the repository resolving them.

use std::collections::HashMap;
use std::sync::Arc;

use vantage_traits::{FunctionId, TraitError, Value, ValueSpecification};

use crate::graph::DependencyNode;

/// Input values of one node invocation, keyed by spec.
#[derive(Debug, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, Value>,
}

impl FunctionInputs {
    /// Wrap resolved input values.
    pub fn new(values: HashMap<ValueSpecification, Value>) -> Self {
        Self { values }
    }

    /// Value of one input.
    pub fn get(&self, spec: &ValueSpecification) -> Option<&Value> {
        self.values.get(spec)
    }

    /// First input with the given value name.
    pub fn by_name(&self, value_name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name == value_name)
            .map(|(_, v)| v)
    }

    /// All inputs.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &Value)> {
        self.values.iter()
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the node has no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outputs of one node invocation.
pub type FunctionResult = Result<Vec<Value>, TraitError>;

/// A deterministic computation run on one dependency node.
///
/// Returns one value per entry of `node.outputs`, in the same order.
pub trait NodeFunction: Send + Sync {
    /// Compute the node's outputs from its inputs.
    fn compute(&self, node: &DependencyNode, inputs: &FunctionInputs) -> FunctionResult;
}

impl<F> NodeFunction for F
where
    F: Fn(&DependencyNode, &FunctionInputs) -> FunctionResult + Send + Sync,
{
    fn compute(&self, node: &DependencyNode, inputs: &FunctionInputs) -> FunctionResult {
        self(node, inputs)
    }
}

/// Functions available to cycles, by id.
#[derive(Clone, Default)]
pub struct FunctionRepository {
    functions: HashMap<FunctionId, Arc<dyn NodeFunction>>,
}

impl FunctionRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. A later registration under the same id wins.
    pub fn register(&mut self, id: impl Into<FunctionId>, function: impl NodeFunction + 'static) {
        self.functions.insert(id.into(), Arc::new(function));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_function(mut self, id: impl Into<FunctionId>, function: impl NodeFunction + 'static) -> Self {
        self.register(id, function);
        self
    }

    /// Look up a function.
    pub fn get(&self, id: &FunctionId) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(id)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRepository")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
