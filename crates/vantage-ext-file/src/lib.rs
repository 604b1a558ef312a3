//! # Vantage Ext File
//!
//! File-backed market data for the Vantage view cycle engine.
//!
//! This crate provides default implementations for demos, replays and EOD runs:
//! - [`CsvTickReplay`]: recorded raw ticks replayed into an in-memory feed
//! - [`JsonSnapshotStore`]: user snapshots persisted as JSON files
//! - [`SnapshotLiveDataProvider`]: serves the frozen values of one user snapshot
//! - [`FileMarketDataResolver`]: maps market data specifications onto the above

#![warn(missing_docs)]
#![warn(clippy::all)]

mod replay;
mod resolver;
mod snapshot_store;

pub use replay::*;
pub use resolver::*;
pub use snapshot_store::*;

use std::path::Path;
use std::sync::Arc;

use vantage_engine::InMemoryLiveDataProvider;
use vantage_traits::TraitError;

/// Create a resolver whose default live source replays `ticks_csv` and whose
/// user snapshots live under `snapshot_dir`.
///
/// Returns the replay alongside so the caller can drive it.
pub fn create_file_market_data(
    ticks_csv: impl AsRef<Path>,
    snapshot_dir: impl AsRef<Path>,
    feed: Arc<InMemoryLiveDataProvider>,
) -> Result<(Arc<CsvTickReplay>, FileMarketDataResolver), TraitError> {
    let replay = Arc::new(CsvTickReplay::new(ticks_csv, feed)?);
    let resolver = FileMarketDataResolver::new(replay.clone())
        .with_snapshot_store(JsonSnapshotStore::open(snapshot_dir)?);
    Ok((replay, resolver))
}
