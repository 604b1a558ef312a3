//! Execution sequences.
//!
//! An execution sequence is the ordered, possibly infinite, stream of
//! [`CycleExecutionOptions`] that drives a view process. It is consumed by a
//! single worker:
//! - [`ArbitrarySequence`]: finite, popped from the front
//! - [`RealTimeSequence`]: infinite, stamped with the current time
//! - [`MergingSequence`]: wraps another sequence and fills gaps from fixed defaults

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use vantage_traits::config::{CycleExecutionOptions, ExecutionSequenceConfig};
use vantage_traits::market_data::MarketDataSpecification;

// =============================================================================
// CLOCKS
// =============================================================================

/// Source of "now" for real-time sequences and valuation time fallbacks.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Set the clock.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// SEQUENCE TRAIT
// =============================================================================

/// Ordered stream of per-cycle execution options.
pub trait ExecutionSequence: Send {
    /// Pull the next cycle's options, filling absent fields from `defaults`.
    ///
    /// `None` means the sequence is permanently exhausted.
    fn next(&mut self, defaults: Option<&CycleExecutionOptions>) -> Option<CycleExecutionOptions>;

    /// True once [`next`](Self::next) will only return `None`.
    fn is_empty(&self) -> bool;

    /// Number of remaining cycles, if finite.
    fn remaining(&self) -> Option<usize> {
        None
    }
}

// =============================================================================
// ARBITRARY
// =============================================================================

/// Finite sequence of explicit cycle options, consumed destructively.
#[derive(Debug, Clone, Default)]
pub struct ArbitrarySequence {
    cycles: VecDeque<CycleExecutionOptions>,
}

impl ArbitrarySequence {
    /// Create a sequence from explicit options.
    pub fn new(cycles: impl IntoIterator<Item = CycleExecutionOptions>) -> Self {
        Self {
            cycles: cycles.into_iter().collect(),
        }
    }

    /// One cycle per valuation time, with no market data specs of its own.
    pub fn of_valuation_times(times: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        Self::new(times.into_iter().map(CycleExecutionOptions::at))
    }
}

impl ExecutionSequence for ArbitrarySequence {
    fn next(&mut self, defaults: Option<&CycleExecutionOptions>) -> Option<CycleExecutionOptions> {
        self.cycles
            .pop_front()
            .map(|options| options.merged_with(defaults))
    }

    fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.cycles.len())
    }
}

// =============================================================================
// REAL TIME
// =============================================================================

/// Infinite sequence; every pull is stamped with the clock's current time.
///
/// Market data comes from the defaults when they carry any, otherwise from
/// the default live source.
pub struct RealTimeSequence {
    clock: Arc<dyn Clock>,
}

impl RealTimeSequence {
    /// Create a real-time sequence on the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Real-time sequence on the wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ExecutionSequence for RealTimeSequence {
    fn next(&mut self, defaults: Option<&CycleExecutionOptions>) -> Option<CycleExecutionOptions> {
        let mut options = CycleExecutionOptions::at(self.clock.now()).merged_with(defaults);
        if options.market_data_specs.is_empty() {
            options
                .market_data_specs
                .push(MarketDataSpecification::live());
        }
        Some(options)
    }

    fn is_empty(&self) -> bool {
        false
    }
}

// =============================================================================
// MERGING
// =============================================================================

/// Wraps a sequence and fills fields still absent after the caller's defaults
/// from a fixed set of its own.
pub struct MergingSequence {
    inner: Box<dyn ExecutionSequence>,
    defaults: CycleExecutionOptions,
}

impl MergingSequence {
    /// Wrap `inner`, falling back to `defaults`.
    pub fn new(inner: Box<dyn ExecutionSequence>, defaults: CycleExecutionOptions) -> Self {
        Self { inner, defaults }
    }
}

impl ExecutionSequence for MergingSequence {
    fn next(&mut self, defaults: Option<&CycleExecutionOptions>) -> Option<CycleExecutionOptions> {
        self.inner
            .next(defaults)
            .map(|options| options.merged_with(Some(&self.defaults)))
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn remaining(&self) -> Option<usize> {
        self.inner.remaining()
    }
}

/// Materialise a configured sequence.
pub fn sequence_from_config(
    config: &ExecutionSequenceConfig,
    clock: Arc<dyn Clock>,
) -> Box<dyn ExecutionSequence> {
    match config {
        ExecutionSequenceConfig::RealTime => Box::new(RealTimeSequence::new(clock)),
        ExecutionSequenceConfig::Arbitrary { valuation_times } => Box::new(
            ArbitrarySequence::of_valuation_times(valuation_times.iter().copied()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_arbitrary_yields_in_order_then_exhausts() {
        let mut seq = ArbitrarySequence::of_valuation_times([day(1), day(2)]);
        assert_eq!(seq.remaining(), Some(2));
        assert_eq!(seq.next(None).unwrap().valuation_time, Some(day(1)));
        assert!(!seq.is_empty());
        assert_eq!(seq.next(None).unwrap().valuation_time, Some(day(2)));
        assert!(seq.is_empty());
        assert!(seq.next(None).is_none());
        assert!(seq.next(None).is_none());
    }

    #[test]
    fn test_empty_arbitrary_sequence() {
        let mut seq = ArbitrarySequence::new(Vec::new());
        assert!(seq.is_empty());
        assert!(seq.next(None).is_none());
    }

    #[test]
    fn test_defaults_fill_missing_fields_only() {
        let defaults = CycleExecutionOptions::at(day(20))
            .with_market_data(MarketDataSpecification::user_snapshot("eod"));
        let mut seq = ArbitrarySequence::new([
            CycleExecutionOptions::at(day(1)),
            CycleExecutionOptions::default().with_market_data(MarketDataSpecification::live()),
        ]);

        let first = seq.next(Some(&defaults)).unwrap();
        assert_eq!(first.valuation_time, Some(day(1)));
        assert_eq!(
            first.market_data_specs,
            vec![MarketDataSpecification::user_snapshot("eod")]
        );

        let second = seq.next(Some(&defaults)).unwrap();
        assert_eq!(second.valuation_time, Some(day(20)));
        assert_eq!(second.market_data_specs, vec![MarketDataSpecification::live()]);
    }

    #[test]
    fn test_merging_sequence_uses_own_defaults_last() {
        let inner = ArbitrarySequence::new([CycleExecutionOptions::default()]);
        let mut seq = MergingSequence::new(
            Box::new(inner),
            CycleExecutionOptions::at(day(5)).with_market_data(MarketDataSpecification::live()),
        );
        let caller = CycleExecutionOptions::at(day(9));

        let options = seq.next(Some(&caller)).unwrap();
        assert_eq!(options.valuation_time, Some(day(9)));
        assert_eq!(options.market_data_specs, vec![MarketDataSpecification::live()]);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_real_time_is_never_empty_and_non_decreasing() {
        let clock = Arc::new(ManualClock::new(day(1)));
        let mut seq = RealTimeSequence::new(clock.clone());

        let mut last = None;
        for _ in 0..5 {
            assert!(!seq.is_empty());
            let options = seq.next(None).unwrap();
            assert_eq!(options.market_data_specs, vec![MarketDataSpecification::live()]);
            let t = options.valuation_time.unwrap();
            if let Some(prev) = last {
                assert!(t >= prev);
            }
            last = Some(t);
            clock.advance(ChronoDuration::milliseconds(250));
        }
        assert_eq!(last, Some(day(1) + ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_real_time_keeps_default_market_data() {
        let mut seq = RealTimeSequence::new(Arc::new(ManualClock::new(day(3))));
        let defaults = CycleExecutionOptions::at(day(1))
            .with_market_data(MarketDataSpecification::user_snapshot("s1"));
        let options = seq.next(Some(&defaults)).unwrap();
        assert_eq!(options.valuation_time, Some(day(3)));
        assert_eq!(
            options.market_data_specs,
            vec![MarketDataSpecification::user_snapshot("s1")]
        );
    }

    proptest! {
        #[test]
        fn prop_arbitrary_exhausts_after_n_pulls(n in 0usize..40) {
            let times: Vec<_> = (0..n).map(|i| day(1) + ChronoDuration::minutes(i as i64)).collect();
            let mut seq = sequence_from_config(
                &ExecutionSequenceConfig::Arbitrary { valuation_times: times.clone() },
                Arc::new(SystemClock),
            );
            for expected in &times {
                prop_assert!(!seq.is_empty());
                prop_assert_eq!(seq.next(None).and_then(|o| o.valuation_time), Some(*expected));
            }
            prop_assert!(seq.is_empty());
            prop_assert!(seq.next(None).is_none());
        }
    }
}
