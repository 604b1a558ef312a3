//! Result models published to view process listeners.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vantage_traits::{ExternalId, Value};

use crate::cycle::CycleType;
use crate::ids::{CycleId, ViewProcessId};

/// Value name to value.
pub type TargetResults = BTreeMap<String, Value>;

/// Calc config to target to value name to value.
pub type ResultMap = BTreeMap<String, BTreeMap<ExternalId, TargetResults>>;

/// Every terminal output of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewComputationResult {
    /// Producing process
    pub view_process_id: ViewProcessId,
    /// Producing cycle
    pub cycle_id: CycleId,
    /// View name
    pub view_name: String,
    /// Full or delta execution
    pub cycle_type: CycleType,
    /// Valuation time of the cycle
    pub valuation_time: DateTime<Utc>,
    /// When the cycle finished
    pub calculation_time: DateTime<Utc>,
    /// Wall time spent executing
    pub calculation_duration: Duration,
    /// Terminal values
    pub results: ResultMap,
}

impl ViewComputationResult {
    /// Look up one value.
    pub fn value(&self, calc_config: &str, target: &ExternalId, value_name: &str) -> Option<&Value> {
        self.results.get(calc_config)?.get(target)?.get(value_name)
    }

    /// Number of values across all calc configs.
    pub fn value_count(&self) -> usize {
        self.results
            .values()
            .flat_map(|targets| targets.values())
            .map(|values| values.len())
            .sum()
    }
}

/// Terminal outputs that changed since the previous cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDeltaResult {
    /// Producing cycle
    pub cycle_id: CycleId,
    /// Calculation time of the result this delta is relative to
    pub previous_result_timestamp: Option<DateTime<Utc>>,
    /// Changed or new terminal values
    pub changed: ResultMap,
}

impl ViewDeltaResult {
    /// Diff `current` against `previous`. Without a previous result every
    /// value counts as changed.
    pub fn between(current: &ViewComputationResult, previous: Option<&ViewComputationResult>) -> Self {
        let mut changed = ResultMap::new();
        for (calc_config, targets) in &current.results {
            for (target, values) in targets {
                for (name, value) in values {
                    let before = previous.and_then(|p| p.value(calc_config, target, name));
                    if before != Some(value) {
                        changed
                            .entry(calc_config.clone())
                            .or_default()
                            .entry(target.clone())
                            .or_default()
                            .insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Self {
            cycle_id: current.cycle_id,
            previous_result_timestamp: previous.map(|p| p.calculation_time),
            changed,
        }
    }

    /// Look up one changed value.
    pub fn value(&self, calc_config: &str, target: &ExternalId, value_name: &str) -> Option<&Value> {
        self.changed.get(calc_config)?.get(target)?.get(value_name)
    }

    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn result(values: &[(&str, Value)]) -> ViewComputationResult {
        let mut results = ResultMap::new();
        for (target, value) in values {
            results
                .entry("Default".to_string())
                .or_default()
                .entry(ExternalId::new("POS", *target))
                .or_default()
                .insert("PV".to_string(), value.clone());
        }
        ViewComputationResult {
            view_process_id: ViewProcessId::new(),
            cycle_id: CycleId::new(),
            view_name: "View".into(),
            cycle_type: CycleType::Full,
            valuation_time: Utc::now(),
            calculation_time: Utc::now(),
            calculation_duration: Duration::from_millis(3),
            results,
        }
    }

    #[test]
    fn test_delta_contains_only_changes() {
        let previous = result(&[("1", Value::Decimal(dec!(1))), ("2", Value::Decimal(dec!(2)))]);
        let current = result(&[("1", Value::Decimal(dec!(1))), ("2", Value::Decimal(dec!(3)))]);
        assert_eq!(current.value_count(), 2);

        let delta = ViewDeltaResult::between(&current, Some(&previous));
        assert_eq!(delta.previous_result_timestamp, Some(previous.calculation_time));
        assert!(delta.value("Default", &ExternalId::new("POS", "1"), "PV").is_none());
        assert_eq!(
            delta.value("Default", &ExternalId::new("POS", "2"), "PV"),
            Some(&Value::Decimal(dec!(3)))
        );
    }

    #[test]
    fn test_first_delta_contains_everything() {
        let current = result(&[("1", Value::Decimal(dec!(1)))]);
        let delta = ViewDeltaResult::between(&current, None);
        assert!(delta.previous_result_timestamp.is_none());
        assert!(!delta.is_empty());

        let same = ViewDeltaResult::between(&current, Some(&current));
        assert!(same.is_empty());
    }

    #[test]
    fn test_json_keys_targets_by_external_id() {
        let current = result(&[("1", Value::Decimal(dec!(1.5)))]);
        let json = serde_json::to_value(&current).unwrap();
        assert_eq!(json["cycle_type"], "full");
        assert_eq!(json["results"]["Default"]["POS~1"]["PV"]["type"], "decimal");

        let back: ViewComputationResult = serde_json::from_value(json).unwrap();
        assert_eq!(
            back.value("Default", &ExternalId::new("POS", "1"), "PV"),
            Some(&Value::Decimal(dec!(1.5)))
        );
    }
}
