//! Persisted user snapshots.
//!
//! A [`JsonSnapshotStore`] keeps one `<snapshot_id>.json` file per snapshot.
//! A loaded snapshot is served through a [`SnapshotLiveDataProvider`], whose
//! values never tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vantage_traits::market_data::{LiveDataEvent, LiveDataEventSender, LiveDataProvider};
use vantage_traits::{SnapshotId, TraitError, UserPrincipal, Value, ValueRequirement};

// =============================================================================
// STORED FORMAT
// =============================================================================

/// One captured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    /// Requirement the value answers
    pub requirement: ValueRequirement,
    /// Captured value
    pub value: Value,
}

/// A named set of frozen market data values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// Identifier, also the file stem
    pub snapshot_id: String,
    /// Time the values were observed
    pub valuation_time: DateTime<Utc>,
    /// Captured values
    #[serde(default)]
    pub values: Vec<StoredValue>,
}

impl StoredSnapshot {
    /// Create an empty snapshot.
    pub fn new(snapshot_id: impl Into<String>, valuation_time: DateTime<Utc>) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            valuation_time,
            values: Vec::new(),
        }
    }

    /// Add a value.
    pub fn with_value(mut self, requirement: ValueRequirement, value: Value) -> Self {
        self.values.push(StoredValue { requirement, value });
        self
    }

    /// Capture the current values of `requirements` from a provider.
    ///
    /// Requirements the provider has no value for are left out. The
    /// provider snapshot used for the capture is released before returning.
    pub fn capture(
        snapshot_id: impl Into<String>,
        provider: &dyn LiveDataProvider,
        requirements: &[ValueRequirement],
        fallback_time: DateTime<Utc>,
    ) -> Result<Self, TraitError> {
        let id = provider.snapshot()?;
        let valuation_time = provider.snapshot_time(id).unwrap_or(fallback_time);
        let values = requirements
            .iter()
            .filter_map(|r| {
                provider.query_snapshot(id, r).map(|value| StoredValue {
                    requirement: r.clone(),
                    value,
                })
            })
            .collect();
        provider.release_snapshot(id);

        Ok(Self {
            snapshot_id: snapshot_id.into(),
            valuation_time,
            values,
        })
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Directory of JSON snapshot files.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    /// Open a store, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, TraitError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| TraitError::IoError(e.to_string()))?;
        Ok(Self { dir })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, snapshot_id: &str) -> Result<PathBuf, TraitError> {
        let valid = !snapshot_id.is_empty()
            && snapshot_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !snapshot_id.starts_with('.');
        if !valid {
            return Err(TraitError::InvalidInput(format!(
                "invalid snapshot id: {:?}",
                snapshot_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", snapshot_id)))
    }

    /// Write a snapshot, replacing any file with the same id.
    pub fn save(&self, snapshot: &StoredSnapshot) -> Result<PathBuf, TraitError> {
        let path = self.path_for(&snapshot.snapshot_id)?;
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| TraitError::SerializationError(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| TraitError::IoError(e.to_string()))?;
        info!(
            snapshot_id = %snapshot.snapshot_id,
            values = snapshot.values.len(),
            path = %path.display(),
            "Snapshot saved"
        );
        Ok(path)
    }

    /// Read a snapshot.
    pub fn load(&self, snapshot_id: &str) -> Result<StoredSnapshot, TraitError> {
        let path = self.path_for(snapshot_id)?;
        if !path.exists() {
            return Err(TraitError::NotFound(format!("snapshot {}", snapshot_id)));
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| TraitError::IoError(e.to_string()))?;
        let snapshot: StoredSnapshot =
            serde_json::from_str(&content).map_err(|e| TraitError::ParseError(e.to_string()))?;
        if snapshot.snapshot_id != snapshot_id {
            warn!(
                file_id = snapshot_id,
                stored_id = %snapshot.snapshot_id,
                "Snapshot file name and id disagree"
            );
        }
        Ok(snapshot)
    }

    /// Ids of every stored snapshot, sorted.
    pub fn list(&self) -> Result<Vec<String>, TraitError> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| TraitError::IoError(e.to_string()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| TraitError::IoError(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a snapshot. Returns false if it did not exist.
    pub fn delete(&self, snapshot_id: &str) -> Result<bool, TraitError> {
        let path = self.path_for(snapshot_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| TraitError::IoError(e.to_string()))?;
        Ok(true)
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Serves the frozen values of one stored snapshot.
///
/// Subscriptions succeed for requirements the snapshot holds and fail for
/// everything else. Values never change, so no `ValueChanged` events are sent.
pub struct SnapshotLiveDataProvider {
    name: String,
    valuation_time: DateTime<Utc>,
    values: HashMap<ValueRequirement, Value>,
    subscriptions: DashSet<(UserPrincipal, ValueRequirement)>,
    open: DashSet<SnapshotId>,
    next_snapshot: AtomicI64,
    listeners: Mutex<Vec<LiveDataEventSender>>,
}

impl SnapshotLiveDataProvider {
    /// Serve a stored snapshot. Later duplicates of a requirement win.
    pub fn new(snapshot: StoredSnapshot) -> Self {
        let values = snapshot
            .values
            .into_iter()
            .map(|v| (v.requirement, v.value))
            .collect();
        Self {
            name: format!("snapshot:{}", snapshot.snapshot_id),
            valuation_time: snapshot.valuation_time,
            values,
            subscriptions: DashSet::new(),
            open: DashSet::new(),
            next_snapshot: AtomicI64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Time the stored values were observed.
    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.valuation_time
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the snapshot holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of snapshot ids not yet released.
    pub fn open_snapshot_count(&self) -> usize {
        self.open.len()
    }

    /// Number of active (user, requirement) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn send(&self, event: LiveDataEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl LiveDataProvider for SnapshotLiveDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: LiveDataEventSender) {
        self.listeners.lock().push(listener);
    }

    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        for requirement in requirements {
            let event = if self.values.contains_key(requirement) {
                self.subscriptions
                    .insert((user.clone(), requirement.clone()));
                LiveDataEvent::SubscriptionSucceeded {
                    requirement: requirement.clone(),
                }
            } else {
                debug!(provider = %self.name, requirement = %requirement, "Not in snapshot");
                LiveDataEvent::SubscriptionFailed {
                    requirement: requirement.clone(),
                    reason: format!("no value in {}", self.name),
                }
            };
            self.send(event);
        }
    }

    fn unsubscribe_all(&self, user: &UserPrincipal) {
        let mine: Vec<ValueRequirement> = self
            .subscriptions
            .iter()
            .filter(|e| &e.key().0 == user)
            .map(|e| e.key().1.clone())
            .collect();
        for requirement in mine {
            self.subscriptions.remove(&(user.clone(), requirement.clone()));
            if !self.subscriptions.iter().any(|e| e.key().1 == requirement) {
                self.send(LiveDataEvent::SubscriptionStopped { requirement });
            }
        }
    }

    fn snapshot(&self) -> Result<SnapshotId, TraitError> {
        let id = SnapshotId(self.next_snapshot.fetch_add(1, Ordering::SeqCst));
        self.open.insert(id);
        Ok(id)
    }

    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>> {
        self.open.contains(&snapshot).then_some(self.valuation_time)
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement) -> Option<Value> {
        if !self.open.contains(&snapshot) {
            return None;
        }
        self.values.get(requirement).cloned()
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        self.open.remove(&snapshot);
    }
}
