//! View compilation.
//!
//! Graph construction is external to the engine: a [`ViewCompiler`] turns a
//! view into one [`DependencyGraph`] per calculation configuration for a
//! given valuation time.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vantage_traits::{TraitError, ValueRequirement};

use crate::graph::DependencyGraph;

/// Result of compiling a view.
#[derive(Debug, Clone)]
pub struct CompiledView {
    /// View name
    pub view_name: String,
    /// One graph per calculation configuration
    pub graphs: Vec<Arc<DependencyGraph>>,
    /// Valuation time the view was compiled for
    pub compiled_for: DateTime<Utc>,
    /// Last valuation time the compilation is valid for
    pub valid_to: Option<DateTime<Utc>>,
}

impl CompiledView {
    /// Compiled view with no expiry.
    pub fn new(view_name: impl Into<String>, graphs: Vec<Arc<DependencyGraph>>, compiled_for: DateTime<Utc>) -> Self {
        Self {
            view_name: view_name.into(),
            graphs,
            compiled_for,
            valid_to: None,
        }
    }

    /// Set the expiry.
    pub fn valid_until(mut self, valid_to: DateTime<Utc>) -> Self {
        self.valid_to = Some(valid_to);
        self
    }

    /// True if the compilation can be reused at `valuation_time`.
    pub fn is_valid_at(&self, valuation_time: DateTime<Utc>) -> bool {
        self.valid_to.map_or(true, |to| valuation_time <= to)
    }

    /// Graph of a calculation configuration.
    pub fn graph(&self, calc_config: &str) -> Option<&Arc<DependencyGraph>> {
        self.graphs.iter().find(|g| g.calc_config() == calc_config)
    }

    /// Union of the live data requirements of every graph.
    pub fn market_data_requirements(&self) -> BTreeSet<ValueRequirement> {
        self.graphs
            .iter()
            .flat_map(|g| g.market_data_requirements().map(|(_, req)| req.clone()))
            .collect()
    }

    /// True if any graph sources `requirement`.
    pub fn requires(&self, requirement: &ValueRequirement) -> bool {
        self.graphs.iter().any(|g| g.requires(requirement))
    }
}

/// Compiles a view definition into dependency graphs.
#[async_trait]
pub trait ViewCompiler: Send + Sync {
    /// Compile for the given valuation time.
    async fn compile(&self, valuation_time: DateTime<Utc>) -> Result<CompiledView, TraitError>;
}

/// Compiler returning the same pre-built graphs for every valuation time.
pub struct StaticViewCompiler {
    view_name: String,
    graphs: Vec<Arc<DependencyGraph>>,
}

impl StaticViewCompiler {
    /// Serve `graphs` as view `view_name`.
    pub fn new(view_name: impl Into<String>, graphs: Vec<DependencyGraph>) -> Self {
        Self {
            view_name: view_name.into(),
            graphs: graphs.into_iter().map(Arc::new).collect(),
        }
    }
}

#[async_trait]
impl ViewCompiler for StaticViewCompiler {
    async fn compile(&self, valuation_time: DateTime<Utc>) -> Result<CompiledView, TraitError> {
        Ok(CompiledView::new(
            self.view_name.clone(),
            self.graphs.clone(),
            valuation_time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_traits::ExternalId;

    #[tokio::test]
    async fn test_static_compiler() {
        let mut b = DependencyGraph::builder("Default");
        let req = ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", "A"));
        b.add_market_data(req.clone());
        let compiler = StaticViewCompiler::new("View", vec![b.build().unwrap()]);

        let now = Utc::now();
        let view = compiler.compile(now).await.unwrap();
        assert_eq!(view.view_name, "View");
        assert!(view.graph("Default").is_some());
        assert!(view.graph("Other").is_none());
        assert!(view.requires(&req));
        assert_eq!(view.market_data_requirements().len(), 1);
        assert!(view.is_valid_at(now));

        let expiring = view.valid_until(now);
        assert!(!expiring.is_valid_at(now + chrono::Duration::seconds(1)));
    }
}
