//! Console output of view process events.

use vantage_engine::ViewProcessEvent;
use vantage_traits::{ExternalId, Value};

use crate::demo::{CALC_CONFIG, PORTFOLIO_VALUE};

fn format_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::Decimal(d)) => d.round_dp(2).to_string(),
        Some(Value::Missing(reason)) => format!("<{:?}>", reason),
        Some(other) => format!("{:?}", other),
        None => "-".to_string(),
    }
}

/// One line describing an event, or `None` for events not worth printing.
pub fn summarize(event: &ViewProcessEvent, portfolio: &ExternalId) -> Option<String> {
    match event {
        ViewProcessEvent::ViewDefinitionCompiled {
            view_name,
            valuation_time,
            graph_count,
            market_data_requirements,
        } => Some(format!(
            "compiled {} for {}: {} graph(s), {} market data requirement(s)",
            view_name,
            valuation_time,
            graph_count,
            market_data_requirements.len()
        )),
        ViewProcessEvent::ViewDefinitionCompilationFailed { valuation_time, error } => {
            Some(format!("compilation failed for {}: {}", valuation_time, error))
        }
        ViewProcessEvent::CycleStarted { .. } => None,
        ViewProcessEvent::CycleCompleted { full, delta } => {
            let changed: usize = delta
                .changed
                .values()
                .flat_map(|targets| targets.values())
                .map(|values| values.len())
                .sum();
            Some(format!(
                "{} cycle at {} in {} ms: {} = {} ({} changed)",
                full.cycle_type,
                full.valuation_time,
                full.calculation_duration.as_millis(),
                PORTFOLIO_VALUE,
                format_value(full.value(CALC_CONFIG, portfolio, PORTFOLIO_VALUE)),
                changed
            ))
        }
        ViewProcessEvent::CycleExecutionFailed { error, .. } => {
            Some(format!("cycle failed: {}", error))
        }
        ViewProcessEvent::ProcessCompleted => Some("execution sequence completed".to_string()),
        ViewProcessEvent::ProcessTerminated { interrupted } => Some(if *interrupted {
            "process stopped".to_string()
        } else {
            "process finished".to_string()
        }),
    }
}
