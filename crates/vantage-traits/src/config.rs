//! Execution options and engine configuration.
//!
//! Configuration contains:
//! - Execution flags controlling how a view process schedules cycles
//! - Per-cycle execution options (valuation time, market data sources)
//! - Engine-level timeouts and refresh periods
//!
//! Configuration does NOT contain:
//! - The execution sequence itself (materialised by the engine)
//! - Market data values

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market_data::MarketDataSpecification;

// =============================================================================
// EXECUTION FLAGS
// =============================================================================

/// A single execution flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionFlag {
    /// Wait for subscription outcomes of every requirement before executing
    AwaitMarketData,
    /// Request a cycle when a value used by the view changes
    TriggerOnMarketDataChange,
    /// Run cycles on the min/max recomputation period
    TriggerOnTimeElapsed,
    /// Start the next cycle as soon as the previous one completes
    RunAsFastAsPossible,
    /// Do not run the first cycle until something triggers it
    WaitForInitialTrigger,
    /// Compile and subscribe only, never execute
    CompileOnly,
    /// Independent full cycles over a finite sequence
    Batch,
}

impl ExecutionFlag {
    /// All flags, in bit order.
    pub const ALL: [ExecutionFlag; 7] = [
        ExecutionFlag::AwaitMarketData,
        ExecutionFlag::TriggerOnMarketDataChange,
        ExecutionFlag::TriggerOnTimeElapsed,
        ExecutionFlag::RunAsFastAsPossible,
        ExecutionFlag::WaitForInitialTrigger,
        ExecutionFlag::CompileOnly,
        ExecutionFlag::Batch,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of [`ExecutionFlag`]s.
///
/// Flags are independent bits and combinations are not validated; a process
/// given contradictory flags simply honours each one where it applies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ExecutionFlag>", into = "Vec<ExecutionFlag>")]
pub struct ExecutionFlags(u8);

impl ExecutionFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Live ticking: cycles on market data change and on elapsed time.
    pub fn triggers_enabled() -> Self {
        Self::empty()
            .with(ExecutionFlag::TriggerOnMarketDataChange)
            .with(ExecutionFlag::TriggerOnTimeElapsed)
    }

    /// Batch: back-to-back full cycles once market data has settled.
    pub fn batch() -> Self {
        Self::empty()
            .with(ExecutionFlag::Batch)
            .with(ExecutionFlag::RunAsFastAsPossible)
            .with(ExecutionFlag::AwaitMarketData)
    }

    /// Compile only.
    pub fn compile_only() -> Self {
        Self::empty().with(ExecutionFlag::CompileOnly)
    }

    /// Returns a copy with `flag` set.
    pub fn with(mut self, flag: ExecutionFlag) -> Self {
        self.insert(flag);
        self
    }

    /// Set a flag.
    pub fn insert(&mut self, flag: ExecutionFlag) {
        self.0 |= flag.bit();
    }

    /// Clear a flag.
    pub fn remove(&mut self, flag: ExecutionFlag) {
        self.0 &= !flag.bit();
    }

    /// True if `flag` is set.
    pub fn contains(&self, flag: ExecutionFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// True if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the set flags.
    pub fn iter(&self) -> impl Iterator<Item = ExecutionFlag> + '_ {
        ExecutionFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl FromIterator<ExecutionFlag> for ExecutionFlags {
    fn from_iter<I: IntoIterator<Item = ExecutionFlag>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |flags, f| flags.with(f))
    }
}

impl From<Vec<ExecutionFlag>> for ExecutionFlags {
    fn from(flags: Vec<ExecutionFlag>) -> Self {
        flags.into_iter().collect()
    }
}

impl From<ExecutionFlags> for Vec<ExecutionFlag> {
    fn from(flags: ExecutionFlags) -> Self {
        flags.iter().collect()
    }
}

impl fmt::Debug for ExecutionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// CYCLE EXECUTION OPTIONS
// =============================================================================

/// What one cycle should compute against.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CycleExecutionOptions {
    /// Valuation time; when absent the snapshot's time indication is used
    #[serde(default)]
    pub valuation_time: Option<DateTime<Utc>>,

    /// Market data sources in priority order
    #[serde(default)]
    pub market_data_specs: Vec<MarketDataSpecification>,
}

impl CycleExecutionOptions {
    /// Options with only a valuation time.
    pub fn at(valuation_time: DateTime<Utc>) -> Self {
        Self {
            valuation_time: Some(valuation_time),
            market_data_specs: Vec::new(),
        }
    }

    /// Add a market data specification.
    pub fn with_market_data(mut self, spec: MarketDataSpecification) -> Self {
        self.market_data_specs.push(spec);
        self
    }

    /// Fill absent fields from `defaults`. Fields present on `self` always win.
    pub fn merged_with(mut self, defaults: Option<&CycleExecutionOptions>) -> Self {
        if let Some(defaults) = defaults {
            if self.valuation_time.is_none() {
                self.valuation_time = defaults.valuation_time;
            }
            if self.market_data_specs.is_empty() {
                self.market_data_specs = defaults.market_data_specs.clone();
            }
        }
        self
    }
}

// =============================================================================
// VIEW EXECUTION CONFIG
// =============================================================================

/// Serialisable description of an execution sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionSequenceConfig {
    /// Infinite sequence stamped with the current time
    #[default]
    RealTime,
    /// Finite sequence of valuation times
    Arbitrary {
        /// Valuation time of each cycle, in order
        valuation_times: Vec<DateTime<Utc>>,
    },
}

/// Serialisable form of a view's execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewExecutionConfig {
    /// Sequence of cycles
    #[serde(default)]
    pub sequence: ExecutionSequenceConfig,

    /// Execution flags
    #[serde(default)]
    pub flags: ExecutionFlags,

    /// Force a full cycle after this many consecutive delta cycles
    #[serde(default)]
    pub max_successive_delta_cycles: Option<u32>,

    /// Persisted snapshot to run against instead of live data
    #[serde(default)]
    pub market_data_snapshot_id: Option<String>,

    /// Defaults applied to every pulled cycle
    #[serde(default)]
    pub default_cycle_options: Option<CycleExecutionOptions>,
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// View engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name/identifier
    #[serde(default = "default_name")]
    pub name: String,

    /// Upper bound on waiting for subscription outcomes, in milliseconds
    #[serde(default = "default_market_data_timeout_ms")]
    pub market_data_timeout_ms: u64,

    /// Minimum time between time-triggered cycles, in milliseconds
    #[serde(default = "default_min_recomputation_period_ms")]
    pub min_recomputation_period_ms: u64,

    /// Maximum time between time-triggered cycles, in milliseconds
    #[serde(default = "default_max_recomputation_period_ms")]
    pub max_recomputation_period_ms: u64,

    /// Capacity of each process's event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_name() -> String {
    "vantage-engine".to_string()
}

fn default_market_data_timeout_ms() -> u64 {
    10_000
}

fn default_min_recomputation_period_ms() -> u64 {
    1_000
}

fn default_max_recomputation_period_ms() -> u64 {
    30_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl EngineConfig {
    /// Subscription wait timeout.
    pub fn market_data_timeout(&self) -> Duration {
        Duration::from_millis(self.market_data_timeout_ms)
    }

    /// Minimum refresh period.
    pub fn min_recomputation_period(&self) -> Duration {
        Duration::from_millis(self.min_recomputation_period_ms)
    }

    /// Maximum refresh period.
    pub fn max_recomputation_period(&self) -> Duration {
        Duration::from_millis(self.max_recomputation_period_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            market_data_timeout_ms: default_market_data_timeout_ms(),
            min_recomputation_period_ms: default_min_recomputation_period_ms(),
            max_recomputation_period_ms: default_max_recomputation_period_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_flag_presets() {
        let live = ExecutionFlags::triggers_enabled();
        assert!(live.contains(ExecutionFlag::TriggerOnMarketDataChange));
        assert!(live.contains(ExecutionFlag::TriggerOnTimeElapsed));
        assert!(!live.contains(ExecutionFlag::Batch));

        let batch = ExecutionFlags::batch();
        assert!(batch.contains(ExecutionFlag::Batch));
        assert!(batch.contains(ExecutionFlag::RunAsFastAsPossible));
        assert!(batch.contains(ExecutionFlag::AwaitMarketData));
        assert_eq!(batch.iter().count(), 3);
    }

    #[test]
    fn test_flags_insert_remove() {
        let mut flags = ExecutionFlags::empty();
        assert!(flags.is_empty());
        flags.insert(ExecutionFlag::CompileOnly);
        assert!(flags.contains(ExecutionFlag::CompileOnly));
        flags.remove(ExecutionFlag::CompileOnly);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_flags_serialize_as_names() {
        let flags = ExecutionFlags::triggers_enabled();
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(
            json,
            r#"["TRIGGER_ON_MARKET_DATA_CHANGE","TRIGGER_ON_TIME_ELAPSED"]"#
        );
        let back: ExecutionFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }

    #[test]
    fn test_merge_pulled_value_wins() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let defaults = CycleExecutionOptions::at(t2).with_market_data(MarketDataSpecification::live());

        let pulled = CycleExecutionOptions::at(t1);
        let merged = pulled.merged_with(Some(&defaults));
        assert_eq!(merged.valuation_time, Some(t1));
        assert_eq!(merged.market_data_specs, vec![MarketDataSpecification::live()]);

        let bare = CycleExecutionOptions::default().merged_with(None);
        assert_eq!(bare, CycleExecutionOptions::default());
    }

    #[test]
    fn test_engine_config_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.market_data_timeout(), Duration::from_secs(10));
        assert_eq!(config.min_recomputation_period(), Duration::from_secs(1));
        assert_eq!(config.max_recomputation_period(), Duration::from_secs(30));
        assert_eq!(config.name, "vantage-engine");
    }
}
