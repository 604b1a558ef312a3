//! Dependency graphs produced by view compilation.
//!
//! A [`DependencyGraph`] holds the nodes of one calculation configuration.
//! Edges run from the node producing a value to every node consuming it.
//! Construction goes through [`DependencyGraphBuilder`], which rejects cycles
//! and duplicate producers, so a built graph is always a DAG with a
//! precomputed topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use vantage_traits::{ExternalId, FunctionId, ValueRequirement, ValueSpecification};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// NODES
// =============================================================================

/// Position of a node within its graph.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One function application on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Target the function runs on
    pub target: ExternalId,
    /// Function to invoke
    pub function_id: FunctionId,
    /// Values consumed, in the order handed to the function
    pub inputs: Vec<ValueSpecification>,
    /// Values produced, in the order returned by the function
    pub outputs: Vec<ValueSpecification>,
}

impl DependencyNode {
    /// Node with no inputs or outputs yet.
    pub fn new(target: ExternalId, function_id: impl Into<FunctionId>) -> Self {
        Self {
            target,
            function_id: function_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Market data sourcing node for a requirement.
    pub fn market_data(requirement: &ValueRequirement) -> Self {
        Self {
            target: requirement.target.clone(),
            function_id: FunctionId::market_data_sourcing(),
            inputs: Vec::new(),
            outputs: vec![ValueSpecification::market_data(requirement)],
        }
    }

    /// Add an input.
    pub fn with_input(mut self, spec: ValueSpecification) -> Self {
        if !self.inputs.contains(&spec) {
            self.inputs.push(spec);
        }
        self
    }

    /// Add an output named `value_name` on this node's target.
    pub fn with_output(mut self, value_name: impl Into<String>) -> Self {
        let spec = ValueSpecification::new(value_name, self.target.clone(), self.function_id.clone());
        if !self.outputs.contains(&spec) {
            self.outputs.push(spec);
        }
        self
    }

    /// Output spec named `value_name`, if any.
    pub fn output(&self, value_name: &str) -> Option<&ValueSpecification> {
        self.outputs.iter().find(|s| s.value_name == value_name)
    }

    /// True for nodes whose values come from live data.
    pub fn is_market_data(&self) -> bool {
        self.function_id.is_market_data_sourcing()
    }
}

impl fmt::Display for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function_id, self.target)
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Accumulates nodes and validates them into a [`DependencyGraph`].
#[derive(Debug)]
pub struct DependencyGraphBuilder {
    calc_config: String,
    nodes: Vec<DependencyNode>,
    market_data: BTreeMap<ValueSpecification, ValueRequirement>,
    terminal_outputs: BTreeSet<ValueSpecification>,
}

impl DependencyGraphBuilder {
    /// Start a graph for a calculation configuration.
    pub fn new(calc_config: impl Into<String>) -> Self {
        Self {
            calc_config: calc_config.into(),
            nodes: Vec::new(),
            market_data: BTreeMap::new(),
            terminal_outputs: BTreeSet::new(),
        }
    }

    /// Add a node.
    pub fn add_node(&mut self, node: DependencyNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Add (or reuse) the market data sourcing node for a requirement.
    pub fn add_market_data(&mut self, requirement: ValueRequirement) -> ValueSpecification {
        let spec = ValueSpecification::market_data(&requirement);
        if !self.market_data.contains_key(&spec) {
            self.nodes.push(DependencyNode::market_data(&requirement));
            self.market_data.insert(spec.clone(), requirement);
        }
        spec
    }

    /// Mark a value as a result of the view.
    pub fn add_terminal_output(&mut self, spec: ValueSpecification) {
        self.terminal_outputs.insert(spec);
    }

    /// Validate and build.
    pub fn build(self) -> EngineResult<DependencyGraph> {
        let mut producers = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for output in &node.outputs {
                if producers.insert(output.clone(), NodeId(i)).is_some() {
                    return Err(EngineError::ConfigError(format!(
                        "value {} produced by more than one node",
                        output
                    )));
                }
            }
        }

        if let Some(orphan) = self
            .terminal_outputs
            .iter()
            .find(|spec| !producers.contains_key(*spec))
        {
            return Err(EngineError::ConfigError(format!(
                "terminal output {} has no producer",
                orphan
            )));
        }

        let mut graph = DiGraph::with_capacity(self.nodes.len(), 0);
        for i in 0..self.nodes.len() {
            graph.add_node(NodeId(i));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for input in &node.inputs {
                if let Some(producer) = producers.get(input) {
                    if seen.insert(*producer) {
                        graph.add_edge(NodeIndex::new(producer.0), NodeIndex::new(i), ());
                    }
                }
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                let node = &self.nodes[cycle.node_id().index()];
                EngineError::CircularDependency(node.to_string())
            })?
            .into_iter()
            .map(|idx| NodeId(idx.index()))
            .collect();

        tracing::debug!(
            calc_config = %self.calc_config,
            nodes = self.nodes.len(),
            market_data = self.market_data.len(),
            edges = graph.edge_count(),
            "Dependency graph built"
        );

        Ok(DependencyGraph {
            calc_config: self.calc_config,
            nodes: self.nodes,
            graph,
            order,
            producers,
            market_data: self.market_data,
            terminal_outputs: self.terminal_outputs,
        })
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// Validated, acyclic dependency graph of one calculation configuration.
#[derive(Debug)]
pub struct DependencyGraph {
    calc_config: String,
    nodes: Vec<DependencyNode>,
    graph: DiGraph<NodeId, ()>,
    order: Vec<NodeId>,
    producers: HashMap<ValueSpecification, NodeId>,
    market_data: BTreeMap<ValueSpecification, ValueRequirement>,
    terminal_outputs: BTreeSet<ValueSpecification>,
}

impl DependencyGraph {
    /// Start building a graph.
    pub fn builder(calc_config: impl Into<String>) -> DependencyGraphBuilder {
        DependencyGraphBuilder::new(calc_config)
    }

    /// Calculation configuration name.
    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id.0)
    }

    /// All node ids.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Node ids with producers before consumers.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes producing this node's inputs.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes consuming this node's outputs.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        if id.0 >= self.nodes.len() {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(NodeIndex::new(id.0), direction)
            .map(|idx| NodeId(idx.index()))
            .collect()
    }

    /// Node producing `spec`.
    pub fn producer_of(&self, spec: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(spec).copied()
    }

    /// Live data requirements of this graph with the spec each is sourced under.
    pub fn market_data_requirements(
        &self,
    ) -> impl Iterator<Item = (&ValueSpecification, &ValueRequirement)> {
        self.market_data.iter()
    }

    /// True if the graph sources `requirement` from live data.
    pub fn requires(&self, requirement: &ValueRequirement) -> bool {
        self.market_data
            .contains_key(&ValueSpecification::market_data(requirement))
    }

    /// Values reported as view results.
    pub fn terminal_outputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.terminal_outputs
    }
}
