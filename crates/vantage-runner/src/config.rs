//! Runner configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vantage_traits::config::{EngineConfig, ViewExecutionConfig};

/// One holding of the demo portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Position identifier
    pub id: String,
    /// Priced instrument, as `SCHEME~VALUE`
    pub target: String,
    /// Units held
    pub quantity: Decimal,
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// View name
    #[serde(default = "default_view_name")]
    pub view_name: String,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Execution sequence and flags of the view process
    #[serde(default)]
    pub execution: ViewExecutionConfig,

    /// Recorded ticks to replay as the live source
    pub ticks_file: Option<String>,

    /// Directory of persisted user snapshots
    #[serde(default = "default_snapshot_store")]
    pub snapshot_store: String,

    /// Pause between replayed tick batches, in milliseconds
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,

    /// Demo portfolio holdings
    #[serde(default)]
    pub positions: Vec<PositionConfig>,
}

fn default_view_name() -> String {
    "Demo Portfolio".to_string()
}

fn default_snapshot_store() -> String {
    "./data/snapshots".to_string()
}

fn default_replay_interval_ms() -> u64 {
    500
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            view_name: default_view_name(),
            engine: EngineConfig::default(),
            execution: ViewExecutionConfig::default(),
            ticks_file: None,
            snapshot_store: default_snapshot_store(),
            replay_interval_ms: default_replay_interval_ms(),
            positions: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use vantage_traits::config::{ExecutionFlag, ExecutionSequenceConfig};

    #[test]
    fn test_defaults_when_empty() {
        let config: RunnerConfig = toml::from_str("").unwrap();
        assert_eq!(config.view_name, "Demo Portfolio");
        assert_eq!(config.engine.market_data_timeout_ms, 10_000);
        assert_eq!(config.execution.sequence, ExecutionSequenceConfig::RealTime);
        assert!(config.ticks_file.is_none());
        assert!(config.positions.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: RunnerConfig = toml::from_str(
            r#"
            view_name = "Rates Book"
            ticks_file = "data/ticks.csv"
            replay_interval_ms = 50

            [engine]
            min_recomputation_period_ms = 0

            [execution]
            flags = ["TRIGGER_ON_MARKET_DATA_CHANGE", "AWAIT_MARKET_DATA"]
            max_successive_delta_cycles = 5

            [[positions]]
            id = "P1"
            target = "SIM~AAPL"
            quantity = "100"
            "#,
        )
        .unwrap();

        assert_eq!(config.view_name, "Rates Book");
        assert_eq!(config.engine.min_recomputation_period_ms, 0);
        assert!(config.execution.flags.contains(ExecutionFlag::AwaitMarketData));
        assert!(!config.execution.flags.contains(ExecutionFlag::Batch));
        assert_eq!(config.execution.max_successive_delta_cycles, Some(5));
        assert_eq!(config.positions[0].quantity, dec!(100));
    }

    #[test]
    fn test_sample_config_parses() {
        let config: RunnerConfig =
            toml::from_str(include_str!("../../../config/vantage.toml")).unwrap();
        assert_eq!(config.positions.len(), 3);
        assert_eq!(config.ticks_file.as_deref(), Some("data/ticks.csv"));
        assert!(config.execution.flags.contains(ExecutionFlag::TriggerOnMarketDataChange));
    }
}
