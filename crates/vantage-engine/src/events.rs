//! Events published by a view process.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use vantage_traits::config::CycleExecutionOptions;
use vantage_traits::ValueRequirement;

use crate::cycle::CycleType;
use crate::ids::CycleId;
use crate::result::{ViewComputationResult, ViewDeltaResult};

/// Notification to view process subscribers.
///
/// Delivered over a broadcast channel; a lagging subscriber loses the oldest
/// events.
#[derive(Debug, Clone)]
pub enum ViewProcessEvent {
    /// The view was (re)compiled
    ViewDefinitionCompiled {
        /// View name
        view_name: String,
        /// Valuation time compiled for
        valuation_time: DateTime<Utc>,
        /// Number of calc config graphs
        graph_count: usize,
        /// Live data the view needs
        market_data_requirements: BTreeSet<ValueRequirement>,
    },
    /// The view could not be compiled
    ViewDefinitionCompilationFailed {
        /// Valuation time attempted
        valuation_time: DateTime<Utc>,
        /// Failure description
        error: String,
    },
    /// A cycle is about to execute
    CycleStarted {
        /// Cycle id
        cycle_id: CycleId,
        /// Valuation time
        valuation_time: DateTime<Utc>,
        /// Full or delta
        cycle_type: CycleType,
    },
    /// A cycle finished
    CycleCompleted {
        /// Every terminal value
        full: Arc<ViewComputationResult>,
        /// Terminal values that changed since the previous cycle
        delta: Arc<ViewDeltaResult>,
    },
    /// A cycle could not run or failed while running
    CycleExecutionFailed {
        /// Options the cycle was pulled with
        options: CycleExecutionOptions,
        /// Failure description
        error: String,
    },
    /// The execution sequence is exhausted
    ProcessCompleted,
    /// The worker has stopped
    ProcessTerminated {
        /// True when stopped before the sequence completed
        interrupted: bool,
    },
}

impl ViewProcessEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ViewProcessEvent::ViewDefinitionCompiled { .. } => "view_definition_compiled",
            ViewProcessEvent::ViewDefinitionCompilationFailed { .. } => "view_definition_compilation_failed",
            ViewProcessEvent::CycleStarted { .. } => "cycle_started",
            ViewProcessEvent::CycleCompleted { .. } => "cycle_completed",
            ViewProcessEvent::CycleExecutionFailed { .. } => "cycle_execution_failed",
            ViewProcessEvent::ProcessCompleted => "process_completed",
            ViewProcessEvent::ProcessTerminated { .. } => "process_terminated",
        }
    }
}
