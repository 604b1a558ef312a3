//! CSV tick replay.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};
use vantage_engine::{InMemoryLiveDataProvider, ManualClock};
use vantage_traits::market_data::{fields, LiveDataEventSender, LiveDataProvider, RawTick};
use vantage_traits::{ExternalId, SnapshotId, TraitError, UserPrincipal, Value, ValueRequirement};

// =============================================================================
// CSV RECORDS
// =============================================================================

/// CSV record for one raw tick.
#[derive(Debug, Deserialize)]
struct TickRecord {
    timestamp: DateTime<Utc>,
    target: String,
    last: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    volume: Option<f64>,
}

impl TickRecord {
    fn into_tick(self) -> Result<RawTick, TraitError> {
        let target: ExternalId = self.target.parse()?;
        let mut tick = RawTick::new(target, self.timestamp);
        for (name, value) in [
            (fields::LAST_PRICE, self.last),
            (fields::BID, self.bid),
            (fields::ASK, self.ask),
            (fields::BEST_BID, self.best_bid),
            (fields::BEST_ASK, self.best_ask),
            (fields::VOLUME, self.volume),
        ] {
            if let Some(v) = value {
                let v = Decimal::try_from(v).map_err(|e| {
                    TraitError::ParseError(format!("{} for {}: {}", name, tick.target, e))
                })?;
                tick = tick.with_field(name, v);
            }
        }
        Ok(tick)
    }
}

/// Ticks sharing one timestamp.
#[derive(Debug, Clone)]
pub struct TickBatch {
    /// Time of every tick in the batch
    pub timestamp: DateTime<Utc>,
    /// Ticks in file order
    pub ticks: Vec<RawTick>,
}

// =============================================================================
// REPLAY
// =============================================================================

/// Replays a recorded tick file into an in-memory feed, one timestamp at a time.
///
/// Expected columns: `timestamp,target,last,bid,ask,best_bid,best_ask,volume`,
/// with `target` written as `SCHEME~VALUE` and every price column optional.
/// The replay is itself a [`LiveDataProvider`] delegating to its feed, so it
/// can be handed straight to a resolver.
pub struct CsvTickReplay {
    feed: Arc<InMemoryLiveDataProvider>,
    clock: Option<Arc<ManualClock>>,
    batches: Mutex<VecDeque<TickBatch>>,
}

impl CsvTickReplay {
    /// Load a tick file. A missing file gives an empty replay.
    pub fn new(
        file_path: impl AsRef<Path>,
        feed: Arc<InMemoryLiveDataProvider>,
    ) -> Result<Self, TraitError> {
        let path = file_path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "Tick file not found, replay is empty");
            return Ok(Self::from_batches(Vec::new(), feed));
        }
        let reader =
            csv::Reader::from_path(path).map_err(|e| TraitError::IoError(e.to_string()))?;
        let replay = Self::from_batches(Self::read_batches(reader)?, feed);
        info!(path = %path.display(), batches = replay.remaining(), "Tick file loaded");
        Ok(replay)
    }

    /// Load ticks from any CSV source.
    pub fn from_reader(
        source: impl Read,
        feed: Arc<InMemoryLiveDataProvider>,
    ) -> Result<Self, TraitError> {
        let reader = csv::Reader::from_reader(source);
        Ok(Self::from_batches(Self::read_batches(reader)?, feed))
    }

    /// Move `clock` to each batch's timestamp as it is replayed.
    ///
    /// Give the feed the same clock so snapshot times follow the recording.
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn from_batches(batches: Vec<TickBatch>, feed: Arc<InMemoryLiveDataProvider>) -> Self {
        Self {
            feed,
            clock: None,
            batches: Mutex::new(batches.into()),
        }
    }

    fn read_batches<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<TickBatch>, TraitError> {
        let mut ticks = Vec::new();
        for result in reader.deserialize() {
            let record: TickRecord = result.map_err(|e| TraitError::ParseError(e.to_string()))?;
            ticks.push(record.into_tick()?);
        }
        // Stable, so ticks at one timestamp keep their file order
        ticks.sort_by_key(|t| t.timestamp);

        let mut batches: Vec<TickBatch> = Vec::new();
        for tick in ticks {
            match batches.last_mut() {
                Some(batch) if batch.timestamp == tick.timestamp => batch.ticks.push(tick),
                _ => batches.push(TickBatch {
                    timestamp: tick.timestamp,
                    ticks: vec![tick],
                }),
            }
        }
        Ok(batches)
    }

    /// Push the next batch into the feed.
    ///
    /// Returns the batch timestamp, or `None` once the recording is exhausted.
    pub fn advance(&self) -> Option<DateTime<Utc>> {
        let batch = self.batches.lock().pop_front()?;
        if let Some(clock) = &self.clock {
            clock.set(batch.timestamp);
        }
        let stored: usize = batch.ticks.iter().map(|t| self.feed.push_tick(t)).sum();
        debug!(
            timestamp = %batch.timestamp,
            ticks = batch.ticks.len(),
            stored,
            "Tick batch replayed"
        );
        Some(batch.timestamp)
    }

    /// Timestamp of the next batch without replaying it.
    pub fn peek_timestamp(&self) -> Option<DateTime<Utc>> {
        self.batches.lock().front().map(|b| b.timestamp)
    }

    /// Batches not yet replayed.
    pub fn remaining(&self) -> usize {
        self.batches.lock().len()
    }

    /// True once every batch has been replayed.
    pub fn is_exhausted(&self) -> bool {
        self.batches.lock().is_empty()
    }

    /// The feed receiving the ticks.
    pub fn feed(&self) -> &Arc<InMemoryLiveDataProvider> {
        &self.feed
    }
}

impl LiveDataProvider for CsvTickReplay {
    fn name(&self) -> &str {
        self.feed.name()
    }

    fn add_listener(&self, listener: LiveDataEventSender) {
        self.feed.add_listener(listener);
    }

    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        self.feed.subscribe(user, requirements);
    }

    fn unsubscribe_all(&self, user: &UserPrincipal) {
        self.feed.unsubscribe_all(user);
    }

    fn snapshot(&self) -> Result<SnapshotId, TraitError> {
        self.feed.snapshot()
    }

    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>> {
        self.feed.snapshot_time(snapshot)
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement) -> Option<Value> {
        self.feed.query_snapshot(snapshot, requirement)
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        self.feed.release_snapshot(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::tempdir;
    use vantage_engine::Clock;

    const TICKS: &str = "\
timestamp,target,last,bid,ask,best_bid,best_ask,volume
2024-03-01T09:00:01Z,SIM~B,,99,101,,,
2024-03-01T09:00:00Z,SIM~A,10.5,,,,,1000
2024-03-01T09:00:01Z,SIM~A,11,,,,,
";

    fn indicative(ticker: &str) -> ValueRequirement {
        ValueRequirement::new(fields::INDICATIVE_VALUE, ExternalId::new("SIM", ticker))
    }

    #[test]
    fn test_batches_grouped_by_timestamp() {
        let feed = Arc::new(InMemoryLiveDataProvider::new("replay"));
        let replay = CsvTickReplay::from_reader(TICKS.as_bytes(), feed.clone()).unwrap();
        assert_eq!(replay.remaining(), 2);

        let first = replay.advance().unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        assert_eq!(feed.latest(&indicative("A")), Some(Value::Decimal(dec!(10.5))));
        assert_eq!(feed.latest(&indicative("B")), None);

        replay.advance().unwrap();
        assert_eq!(feed.latest(&indicative("A")), Some(Value::Decimal(dec!(11))));
        // Mid of bid and ask
        assert_eq!(feed.latest(&indicative("B")), Some(Value::Decimal(dec!(100))));

        assert!(replay.is_exhausted());
        assert_eq!(replay.advance(), None);
    }

    #[test]
    fn test_clock_follows_recording() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let feed = Arc::new(InMemoryLiveDataProvider::new("replay").with_clock(clock.clone()));
        let replay = CsvTickReplay::from_reader(TICKS.as_bytes(), feed.clone())
            .unwrap()
            .with_clock(clock.clone());

        let ts = replay.advance().unwrap();
        assert_eq!(clock.now(), ts);

        let snap = replay.snapshot().unwrap();
        assert_eq!(replay.snapshot_time(snap), Some(ts));
        replay.release_snapshot(snap);
        assert_eq!(feed.open_snapshot_count(), 0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ticks.csv");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(TICKS.as_bytes())
            .unwrap();

        let replay =
            CsvTickReplay::new(&path, Arc::new(InMemoryLiveDataProvider::new("replay"))).unwrap();
        assert_eq!(replay.remaining(), 2);
        assert_eq!(
            replay.peek_timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let replay = CsvTickReplay::new(
            dir.path().join("absent.csv"),
            Arc::new(InMemoryLiveDataProvider::new("replay")),
        )
        .unwrap();
        assert!(replay.is_exhausted());
    }

    #[test]
    fn test_bad_target_rejected() {
        let csv = "timestamp,target,last,bid,ask,best_bid,best_ask,volume\n\
                   2024-03-01T09:00:00Z,NOSCHEME,1,,,,,\n";
        let result =
            CsvTickReplay::from_reader(csv.as_bytes(), Arc::new(InMemoryLiveDataProvider::new("r")));
        assert!(matches!(result, Err(TraitError::ParseError(_))));
    }
}
