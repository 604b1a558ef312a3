//! Live data delta calculation.
//!
//! Classifies every node of a graph as changed or unchanged between the
//! previous cycle's cache and the current one, so that a delta cycle only
//! recomputes what its new market data can affect.
//!
//! Rules:
//! - A market data node is unchanged only if each of its outputs holds an
//!   equal value in both caches. A value present in one cache only, or in
//!   neither, counts as changed.
//! - Any other node is changed if one of its dependencies changed, if it has
//!   no dependencies at all, or if the current cache already holds a value
//!   for one of its outputs that differs from the previous cycle.

use std::collections::BTreeSet;

use vantage_traits::ValueSpecification;

use crate::cache::ComputationCache;
use crate::graph::{DependencyGraph, NodeId};

/// Partition of a graph's nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaResult {
    /// Nodes that must be recomputed
    pub changed: BTreeSet<NodeId>,
    /// Nodes whose previous outputs can be reused
    pub unchanged: BTreeSet<NodeId>,
}

impl DeltaResult {
    /// True if `node` was classified as changed.
    pub fn is_changed(&self, node: NodeId) -> bool {
        self.changed.contains(&node)
    }

    /// True if `node` was classified as unchanged.
    pub fn is_unchanged(&self, node: NodeId) -> bool {
        self.unchanged.contains(&node)
    }

    /// Number of classified nodes.
    pub fn len(&self) -> usize {
        self.changed.len() + self.unchanged.len()
    }

    /// True if nothing was classified.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes a [`DeltaResult`] for one graph.
pub struct LiveDataDeltaCalculator<'a> {
    graph: &'a DependencyGraph,
    cache: &'a ComputationCache,
    previous: &'a ComputationCache,
}

impl<'a> LiveDataDeltaCalculator<'a> {
    /// Compare `cache` against `previous` over `graph`.
    pub fn new(
        graph: &'a DependencyGraph,
        cache: &'a ComputationCache,
        previous: &'a ComputationCache,
    ) -> Self {
        Self {
            graph,
            cache,
            previous,
        }
    }

    /// Classify every node.
    pub fn compute(&self) -> DeltaResult {
        let mut result = DeltaResult::default();

        // Topological order classifies every dependency before its dependents
        for &id in self.graph.topological_order() {
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let changed = if node.is_market_data() {
                node.outputs.is_empty() || node.outputs.iter().any(|spec| self.differs(spec))
            } else {
                let dependencies = self.graph.dependencies(id);
                dependencies.is_empty()
                    || dependencies.iter().any(|dep| result.is_changed(*dep))
                    || node
                        .outputs
                        .iter()
                        .any(|spec| self.cache.contains(spec) && self.differs(spec))
            };

            if changed {
                result.changed.insert(id);
            } else {
                result.unchanged.insert(id);
            }
        }

        tracing::debug!(
            calc_config = %self.graph.calc_config(),
            changed = result.changed.len(),
            unchanged = result.unchanged.len(),
            "Delta computed"
        );
        result
    }

    fn differs(&self, spec: &ValueSpecification) -> bool {
        match (self.cache.get(spec), self.previous.get(spec)) {
            (Some(current), Some(previous)) => current != previous,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::graph::DependencyNode;
    use crate::ids::CycleId;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use vantage_traits::{ExternalId, Value, ValueRequirement};

    fn cache() -> ComputationCache {
        ComputationCache::new(CacheKey {
            view_name: "View".into(),
            calc_config: "Default".into(),
            cycle_id: CycleId::new(),
        })
    }

    fn set(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    /// node0 <- {node1, node2} <- node3 (market data)
    fn diamond() -> (DependencyGraph, [NodeId; 4], ValueSpecification, ValueSpecification) {
        let mut b = DependencyGraph::builder("Default");
        let md = b.add_market_data(ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", "X")));
        let node3 = NodeId(0);
        let n1 = DependencyNode::new(ExternalId::new("POS", "1"), "F1")
            .with_input(md.clone())
            .with_output("A");
        let n2 = DependencyNode::new(ExternalId::new("POS", "2"), "F2")
            .with_input(md.clone())
            .with_output("B");
        let n1_out = n1.outputs[0].clone();
        let n0 = DependencyNode::new(ExternalId::new("POS", "0"), "F0")
            .with_input(n1_out.clone())
            .with_input(n2.outputs[0].clone())
            .with_output("C");
        let node1 = b.add_node(n1);
        let node2 = b.add_node(n2);
        let node0 = b.add_node(n0);
        (b.build().unwrap(), [node0, node1, node2, node3], md, n1_out)
    }

    #[test]
    fn test_diamond_unchanged_market_data() {
        let (graph, [n0, n1, n2, n3], md, _) = diamond();
        let (current, previous) = (cache(), cache());
        current.put(md.clone(), Value::Decimal(dec!(5)));
        previous.put(md, Value::Decimal(dec!(5)));

        let delta = LiveDataDeltaCalculator::new(&graph, &current, &previous).compute();
        assert!(delta.changed.is_empty());
        assert_eq!(delta.unchanged, set(&[n0, n1, n2, n3]));
    }

    #[test]
    fn test_diamond_changed_market_data() {
        let (graph, nodes, md, _) = diamond();
        let (current, previous) = (cache(), cache());
        current.put(md.clone(), Value::Decimal(dec!(6)));
        previous.put(md, Value::Decimal(dec!(5)));

        let delta = LiveDataDeltaCalculator::new(&graph, &current, &previous).compute();
        assert!(delta.unchanged.is_empty());
        assert_eq!(delta.changed, set(&nodes));
    }

    #[test]
    fn test_diamond_changed_middle_value() {
        let (graph, [n0, n1, n2, n3], md, n1_out) = diamond();
        let (current, previous) = (cache(), cache());
        current.put(md.clone(), Value::Decimal(dec!(5)));
        previous.put(md, Value::Decimal(dec!(5)));
        current.put(n1_out.clone(), Value::Decimal(dec!(1)));
        previous.put(n1_out, Value::Decimal(dec!(2)));

        let delta = LiveDataDeltaCalculator::new(&graph, &current, &previous).compute();
        assert_eq!(delta.changed, set(&[n0, n1]));
        assert_eq!(delta.unchanged, set(&[n2, n3]));
    }

    #[test]
    fn test_missing_market_data_is_changed() {
        let (graph, nodes, md, _) = diamond();
        let (current, previous) = (cache(), cache());
        previous.put(md, Value::Decimal(dec!(5)));

        let delta = LiveDataDeltaCalculator::new(&graph, &current, &previous).compute();
        assert_eq!(delta.changed, set(&nodes));

        let (graph, nodes, _, _) = diamond();
        let delta = LiveDataDeltaCalculator::new(&graph, &cache(), &cache()).compute();
        assert_eq!(delta.changed, set(&nodes));
    }

    #[test]
    fn test_isolated_computed_node_is_changed() {
        let mut b = DependencyGraph::builder("Default");
        let id = b.add_node(DependencyNode::new(ExternalId::new("POS", "1"), "Constant").with_output("K"));
        let graph = b.build().unwrap();
        let delta = LiveDataDeltaCalculator::new(&graph, &cache(), &cache()).compute();
        assert!(delta.is_changed(id));
    }

    fn layered_graph(edges: &[(usize, usize)], computed: usize, leaves: usize) -> (DependencyGraph, Vec<ValueSpecification>) {
        let mut b = DependencyGraph::builder("Default");
        let md: Vec<_> = (0..leaves)
            .map(|i| b.add_market_data(ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", i.to_string()))))
            .collect();
        let mut outputs: Vec<ValueSpecification> = md.clone();
        for i in 0..computed {
            let mut node = DependencyNode::new(ExternalId::new("POS", i.to_string()), "F").with_output("V");
            for &(from, to) in edges {
                if to == i && from < outputs.len() {
                    node = node.with_input(outputs[from].clone());
                }
            }
            outputs.push(node.outputs[0].clone());
            b.add_node(node);
        }
        (b.build().unwrap(), md)
    }

    proptest! {
        #[test]
        fn prop_delta_partitions_nodes(
            leaves in 1usize..6,
            computed in 0usize..12,
            edges in proptest::collection::vec((0usize..18, 0usize..12), 0..40),
            current_values in proptest::collection::vec(proptest::option::of(0i64..3), 6),
            previous_values in proptest::collection::vec(proptest::option::of(0i64..3), 6),
        ) {
            let (graph, md) = layered_graph(&edges, computed, leaves);
            let (current, previous) = (cache(), cache());
            for (i, spec) in md.iter().enumerate() {
                if let Some(v) = current_values[i] {
                    current.put(spec.clone(), Value::Decimal(Decimal::from(v)));
                }
                if let Some(v) = previous_values[i] {
                    previous.put(spec.clone(), Value::Decimal(Decimal::from(v)));
                }
            }

            let delta = LiveDataDeltaCalculator::new(&graph, &current, &previous).compute();
            prop_assert_eq!(delta.len(), graph.len());
            prop_assert!(delta.changed.is_disjoint(&delta.unchanged));
            for id in graph.node_ids() {
                prop_assert!(delta.is_changed(id) ^ delta.is_unchanged(id));
                if delta.is_unchanged(id) {
                    for dep in graph.dependencies(id) {
                        prop_assert!(delta.is_unchanged(dep));
                    }
                }
                for dep in graph.dependencies(id) {
                    if delta.is_changed(dep) {
                        prop_assert!(delta.is_changed(id));
                    }
                }
            }
        }
    }
}
