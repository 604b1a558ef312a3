//! # Vantage Engine
//!
//! View cycle execution with live data snapshots and delta recomputation.
//!
//! This crate provides:
//! - [`ExecutionSequence`]: Ordered cycle descriptors (real-time or arbitrary valuation times)
//! - [`DelegatingSnapshotProvider`]: Scheme-routed live data with composite snapshots
//! - [`ComputationCache`]: Per-cycle value store keyed by value specification
//! - [`LiveDataDeltaCalculator`]: Classifies graph nodes as changed or unchanged between cycles
//! - [`ViewProcess`]: Cycle scheduler driving compilation, snapshots and execution
//!
//! ## Architecture
//!
//! ```text
//! ExecutionSequence ─> ViewProcess ─┬─> ViewCompiler ─> DependencyGraph
//!                                   │
//!                   Triggers ───────┤
//!                                   ├─> LiveDataProvider ─> snapshot
//!                                   │
//!                                   └─> SingleComputationCycle ─┬─> ComputationCache
//!                                                               │
//!                                                               └─> DeltaCalculator
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let process = ViewProcess::builder("Portfolio")
//!     .with_compiler(compiler)
//!     .with_resolver(Arc::new(SingleProviderResolver::new(feed)))
//!     .with_functions(functions)
//!     .with_options(ViewExecutionOptions::new(sequence, ExecutionFlags::triggers_enabled()))
//!     .build()?;
//!
//! let mut events = process.subscribe();
//! process.start().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod compiler;
pub mod cycle;
pub mod delta;
pub mod error;
pub mod events;
pub mod function;
pub mod graph;
pub mod ids;
pub mod live_data;
pub mod process;
pub mod result;
pub mod sequence;
pub mod trigger;

// Re-exports
pub use cache::{CacheKey, ComputationCache, ComputationCacheSource};
pub use compiler::{CompiledView, StaticViewCompiler, ViewCompiler};
pub use cycle::{CycleReference, CycleState, CycleType, SingleComputationCycle};
pub use delta::{DeltaResult, LiveDataDeltaCalculator};
pub use error::{EngineError, EngineResult};
pub use events::ViewProcessEvent;
pub use function::{FunctionInputs, FunctionRepository, FunctionResult, NodeFunction};
pub use graph::{DependencyGraph, DependencyGraphBuilder, DependencyNode, NodeId};
pub use ids::{CycleId, ViewProcessId};
pub use live_data::{
    DelegatingSnapshotProvider, DelegatingSnapshotProviderBuilder, InMemoryLiveDataProvider,
    NormalizationRuleSet, PrioritizedLiveDataProvider, SingleProviderResolver,
};
pub use process::{
    CycleStatistics, ProcessState, ViewExecutionOptions, ViewProcess, ViewProcessBuilder,
};
pub use result::{ResultMap, ViewComputationResult, ViewDeltaResult};
pub use sequence::{
    ArbitrarySequence, Clock, ExecutionSequence, ManualClock, MergingSequence, RealTimeSequence,
    SystemClock,
};
pub use trigger::{CombinedTrigger, Eligibility, TriggerResult, ViewCycleTrigger};
