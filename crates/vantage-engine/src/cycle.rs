//! Single computation cycles.
//!
//! A [`SingleComputationCycle`] evaluates every graph of a compiled view once
//! against one live data snapshot:
//!
//! ```text
//! snapshot ─> prepare inputs ─┬─> (delta) copy unchanged from previous cycle
//!                             └─> execute remaining nodes in topological order
//! ```
//!
//! Cycles are handed out through [`CycleReference`]s; unlocking the reference
//! releases the cycle's caches.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use vantage_traits::market_data::LiveDataProvider;
use vantage_traits::{MissingValue, SnapshotId, Value};

use crate::cache::{ComputationCache, ComputationCacheSource};
use crate::compiler::CompiledView;
use crate::delta::LiveDataDeltaCalculator;
use crate::error::{EngineError, EngineResult};
use crate::function::{FunctionInputs, FunctionRepository};
use crate::graph::{DependencyGraph, NodeId};
use crate::ids::{CycleId, ViewProcessId};
use crate::result::{ResultMap, ViewComputationResult};

/// Whether a cycle recomputes everything or only what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleType {
    /// Every node is executed
    Full,
    /// Unchanged nodes are copied from the previous cycle
    Delta,
}

impl fmt::Display for CycleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleType::Full => write!(f, "full"),
            CycleType::Delta => write!(f, "delta"),
        }
    }
}

/// Lifecycle of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Created, not yet executed
    AwaitingExecution,
    /// Executing
    Executing,
    /// Executed successfully
    Executed,
    /// Execution aborted
    Failed,
}

/// Per calc config execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphExecutionStats {
    /// Nodes whose function ran
    pub executed: usize,
    /// Nodes copied from the previous cycle
    pub reused: usize,
    /// Nodes that produced missing values
    pub failed: usize,
    /// Market data requirements missing from the snapshot
    pub missing_market_data: usize,
}

/// Inputs a cycle needs besides its own state.
pub struct CycleContext<'a> {
    /// Provider the snapshot was taken from
    pub provider: &'a dyn LiveDataProvider,
    /// Snapshot to read market data from
    pub snapshot: SnapshotId,
    /// Node functions
    pub functions: &'a FunctionRepository,
    /// Fail the cycle when the snapshot has none of the required market data
    pub suppress_without_market_data: bool,
    /// Polled between nodes; `true` aborts the cycle
    pub cancelled: &'a (dyn Fn() -> bool + Sync),
}

/// One evaluation of a compiled view.
pub struct SingleComputationCycle {
    id: CycleId,
    view_process_id: ViewProcessId,
    view: Arc<CompiledView>,
    valuation_time: DateTime<Utc>,
    cycle_type: CycleType,
    caches: HashMap<String, Arc<ComputationCache>>,
    stats: HashMap<String, GraphExecutionStats>,
    state: CycleState,
    duration: Duration,
    completed_at: Option<DateTime<Utc>>,
}

impl SingleComputationCycle {
    /// Create a cycle, allocating its caches from `cache_source`.
    pub fn new(
        view_process_id: ViewProcessId,
        view: Arc<CompiledView>,
        valuation_time: DateTime<Utc>,
        cycle_type: CycleType,
        cache_source: &ComputationCacheSource,
    ) -> Self {
        let id = CycleId::new();
        let caches = view
            .graphs
            .iter()
            .map(|g| {
                let cache = cache_source.get_cache(&view.view_name, g.calc_config(), id);
                (g.calc_config().to_string(), cache)
            })
            .collect();
        Self {
            id,
            view_process_id,
            view,
            valuation_time,
            cycle_type,
            caches,
            stats: HashMap::new(),
            state: CycleState::AwaitingExecution,
            duration: Duration::ZERO,
            completed_at: None,
        }
    }

    /// Cycle id.
    pub fn id(&self) -> CycleId {
        self.id
    }

    /// Valuation time.
    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.valuation_time
    }

    /// Full or delta.
    pub fn cycle_type(&self) -> CycleType {
        self.cycle_type
    }

    /// Lifecycle state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Execution time.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Compiled view the cycle ran.
    pub fn view(&self) -> &Arc<CompiledView> {
        &self.view
    }

    /// Cache of a calc config.
    pub fn cache(&self, calc_config: &str) -> Option<&Arc<ComputationCache>> {
        self.caches.get(calc_config)
    }

    /// Execution counters of a calc config.
    pub fn stats(&self, calc_config: &str) -> Option<GraphExecutionStats> {
        self.stats.get(calc_config).copied()
    }

    /// Execute the cycle.
    ///
    /// A delta cycle reuses `previous` for every node whose inputs did not
    /// change; without a previous cycle it behaves as a full cycle.
    pub fn execute(
        &mut self,
        previous: Option<&SingleComputationCycle>,
        ctx: &CycleContext<'_>,
    ) -> EngineResult<()> {
        if self.state != CycleState::AwaitingExecution {
            return Err(EngineError::IllegalState(format!(
                "cycle {} already executed",
                self.id
            )));
        }
        self.state = CycleState::Executing;
        let started = Instant::now();

        let result = self.run(previous, ctx);
        self.duration = started.elapsed();
        self.state = if result.is_ok() {
            CycleState::Executed
        } else {
            CycleState::Failed
        };
        self.completed_at = Some(Utc::now());
        result
    }

    fn run(&mut self, previous: Option<&SingleComputationCycle>, ctx: &CycleContext<'_>) -> EngineResult<()> {
        let view = self.view.clone();

        let mut required = 0;
        let mut missing = 0;
        for graph in &view.graphs {
            let cache = self.cache_for(graph)?;
            let (r, m) = prepare_inputs(graph, &cache, ctx);
            required += r;
            missing += m;
            self.stats.entry(graph.calc_config().to_string()).or_default().missing_market_data = m;
        }
        if ctx.suppress_without_market_data && required > 0 && missing == required {
            return Err(EngineError::MissingMarketData(format!(
                "none of the {} market data requirements are available",
                required
            )));
        }

        for graph in &view.graphs {
            let cache = self.cache_for(graph)?;
            let previous_cache = match (self.cycle_type, previous) {
                (CycleType::Delta, Some(prev)) => prev.cache(graph.calc_config()).cloned(),
                _ => None,
            };
            let reused = match &previous_cache {
                Some(prev) => reuse_unchanged(graph, &cache, prev),
                None => BTreeSet::new(),
            };
            let stats = self.stats.entry(graph.calc_config().to_string()).or_default();
            stats.reused = reused.len();
            execute_graph(graph, &cache, &reused, ctx, stats)?;

            debug!(
                cycle = %self.id,
                calc_config = %graph.calc_config(),
                cycle_type = %self.cycle_type,
                executed = stats.executed,
                reused = stats.reused,
                failed = stats.failed,
                "Graph executed"
            );
        }
        Ok(())
    }

    fn cache_for(&self, graph: &DependencyGraph) -> EngineResult<Arc<ComputationCache>> {
        self.caches
            .get(graph.calc_config())
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no cache for {}", graph.calc_config())))
    }

    /// Terminal outputs of every graph as a result model.
    pub fn to_result(&self) -> ViewComputationResult {
        let mut results = ResultMap::new();
        for graph in &self.view.graphs {
            let Some(cache) = self.caches.get(graph.calc_config()) else {
                continue;
            };
            for spec in graph.terminal_outputs() {
                if let Some(value) = cache.get(spec) {
                    results
                        .entry(graph.calc_config().to_string())
                        .or_default()
                        .entry(spec.target.clone())
                        .or_default()
                        .insert(spec.value_name.clone(), value);
                }
            }
        }
        ViewComputationResult {
            view_process_id: self.view_process_id,
            cycle_id: self.id,
            view_name: self.view.view_name.clone(),
            cycle_type: self.cycle_type,
            valuation_time: self.valuation_time,
            calculation_time: self.completed_at.unwrap_or_else(Utc::now),
            calculation_duration: self.duration,
            results,
        }
    }
}

/// Load market data from the snapshot. Returns (required, missing).
fn prepare_inputs(graph: &DependencyGraph, cache: &ComputationCache, ctx: &CycleContext<'_>) -> (usize, usize) {
    let mut required = 0;
    let mut missing = 0;
    for (spec, requirement) in graph.market_data_requirements() {
        required += 1;
        let value = match ctx.provider.query_snapshot(ctx.snapshot, requirement) {
            Some(value) => value,
            None => {
                missing += 1;
                trace!(requirement = %requirement, "No market data in snapshot");
                Value::Missing(MissingValue::MissingMarketData)
            }
        };
        cache.put(spec.clone(), value);
    }
    (required, missing)
}

/// Copy outputs of unchanged computed nodes from the previous cache.
fn reuse_unchanged(
    graph: &DependencyGraph,
    cache: &ComputationCache,
    previous: &ComputationCache,
) -> BTreeSet<NodeId> {
    let delta = LiveDataDeltaCalculator::new(graph, cache, previous).compute();
    let mut reused = BTreeSet::new();
    for &id in &delta.unchanged {
        let Some(node) = graph.node(id) else {
            continue;
        };
        // Market data is already in the cache
        if node.is_market_data() {
            continue;
        }
        let prior: Option<Vec<Value>> = node.outputs.iter().map(|spec| previous.get(spec)).collect();
        let Some(prior) = prior else {
            continue;
        };
        for (spec, value) in node.outputs.iter().zip(prior) {
            let value = if value.is_missing() {
                Value::Missing(MissingValue::Suppressed)
            } else {
                value
            };
            cache.put(spec.clone(), value);
        }
        reused.insert(id);
    }
    reused
}

fn execute_graph(
    graph: &DependencyGraph,
    cache: &ComputationCache,
    reused: &BTreeSet<NodeId>,
    ctx: &CycleContext<'_>,
    stats: &mut GraphExecutionStats,
) -> EngineResult<()> {
    for &id in graph.topological_order() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        if node.is_market_data() || reused.contains(&id) {
            continue;
        }
        if (ctx.cancelled)() {
            return Err(EngineError::Shutdown);
        }

        let mut inputs = HashMap::with_capacity(node.inputs.len());
        let mut inputs_missing = false;
        for spec in &node.inputs {
            match cache.get(spec) {
                Some(value) if !value.is_missing() => {
                    inputs.insert(spec.clone(), value);
                }
                _ => inputs_missing = true,
            }
        }

        let outputs = if inputs_missing {
            None
        } else {
            match ctx.functions.get(&node.function_id) {
                Some(function) => match function.compute(node, &FunctionInputs::new(inputs)) {
                    Ok(values) if values.len() == node.outputs.len() => Some(values),
                    Ok(values) => {
                        warn!(node = %node, expected = node.outputs.len(), got = values.len(), "Function returned wrong number of outputs");
                        None
                    }
                    Err(e) => {
                        debug!(node = %node, error = %e, "Function evaluation failed");
                        None
                    }
                },
                None => {
                    warn!(node = %node, "No function registered");
                    None
                }
            }
        };

        match outputs {
            Some(values) => {
                stats.executed += 1;
                for (spec, value) in node.outputs.iter().zip(values) {
                    cache.put(spec.clone(), value);
                }
            }
            None => {
                stats.failed += 1;
                let reason = if inputs_missing {
                    MissingValue::MissingInputs
                } else {
                    MissingValue::EvaluationError
                };
                for spec in &node.outputs {
                    cache.put(spec.clone(), Value::Missing(reason));
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// CYCLE REFERENCES
// =============================================================================

/// Handle keeping a cycle and its caches alive.
///
/// [`get`](Self::get) after [`unlock`](Self::unlock), or unlocking twice, is
/// an [`EngineError::IllegalState`]. Dropping a locked handle unlocks it.
pub struct CycleReference {
    cycle: Option<Arc<SingleComputationCycle>>,
    cache_source: Arc<ComputationCacheSource>,
}

impl CycleReference {
    /// Take a reference on an executed cycle.
    pub fn new(cycle: Arc<SingleComputationCycle>, cache_source: Arc<ComputationCacheSource>) -> Self {
        Self {
            cycle: Some(cycle),
            cache_source,
        }
    }

    /// The referenced cycle.
    pub fn get(&self) -> EngineResult<&Arc<SingleComputationCycle>> {
        self.cycle
            .as_ref()
            .ok_or_else(|| EngineError::IllegalState("cycle reference already unlocked".into()))
    }

    /// True until unlocked.
    pub fn is_locked(&self) -> bool {
        self.cycle.is_some()
    }

    /// Release the cycle and its caches.
    pub fn unlock(&mut self) -> EngineResult<()> {
        let cycle = self
            .cycle
            .take()
            .ok_or_else(|| EngineError::IllegalState("cycle reference unlocked twice".into()))?;
        let released = self.cache_source.release_caches(cycle.id());
        trace!(cycle = %cycle.id(), caches = released, "Cycle released");
        Ok(())
    }
}

impl Drop for CycleReference {
    fn drop(&mut self) {
        if self.is_locked() {
            let _ = self.unlock();
        }
    }
}
