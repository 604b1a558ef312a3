//! Live data provider traits.
//!
//! A [`LiveDataProvider`] owns subscriptions to an external feed and hands out
//! point-in-time snapshots:
//! - subscriptions are requested per [`ValueRequirement`]; their outcome arrives
//!   later as a [`LiveDataEvent`] on every registered listener channel
//! - [`LiveDataProvider::snapshot`] freezes the current values under an opaque
//!   [`SnapshotId`] which stays queryable until released
//!
//! Providers are shared between view processes and must be internally
//! synchronized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TraitError;
use crate::ids::*;
use crate::value::Value;

/// Canonical and vendor field names carried by raw ticks.
pub mod fields {
    /// Last traded price
    pub const LAST_PRICE: &str = "LAST_PRICE";
    /// Bid price
    pub const BID: &str = "BID";
    /// Ask price
    pub const ASK: &str = "ASK";
    /// Best bid across venues
    pub const BEST_BID: &str = "BEST_BID";
    /// Best ask across venues
    pub const BEST_ASK: &str = "BEST_ASK";
    /// Traded volume
    pub const VOLUME: &str = "VOLUME";
    /// Canonical normalized market value
    pub const INDICATIVE_VALUE: &str = "IndicativeValue";
}

/// Field name to value map of one raw or normalized update.
pub type FieldMap = BTreeMap<String, Decimal>;

// =============================================================================
// RAW TICKS
// =============================================================================

/// One update from an external feed, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    /// Target the update is for
    pub target: ExternalId,
    /// Raw vendor fields
    pub fields: FieldMap,
    /// Time of the update
    pub timestamp: DateTime<Utc>,
}

impl RawTick {
    /// Create a tick with no fields.
    pub fn new(target: ExternalId, timestamp: DateTime<Utc>) -> Self {
        Self {
            target,
            fields: FieldMap::new(),
            timestamp,
        }
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, value: Decimal) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

// =============================================================================
// MARKET DATA SPECIFICATIONS
// =============================================================================

/// Where the market data for a cycle comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketDataSpecification {
    /// Ticking live data from a named source
    Live {
        /// Data source name, `None` for the default live source
        #[serde(default)]
        data_source: Option<String>,
    },
    /// Frozen values from a persisted user snapshot
    UserSnapshot {
        /// Snapshot identifier in the snapshot store
        snapshot_id: String,
    },
    /// Historical close values for a fixed date
    FixedHistorical {
        /// Observation date
        date: NaiveDate,
    },
}

impl MarketDataSpecification {
    /// Live data from the default source.
    pub fn live() -> Self {
        MarketDataSpecification::Live { data_source: None }
    }

    /// Frozen values from a persisted snapshot.
    pub fn user_snapshot(snapshot_id: impl Into<String>) -> Self {
        MarketDataSpecification::UserSnapshot {
            snapshot_id: snapshot_id.into(),
        }
    }
}

impl fmt::Display for MarketDataSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketDataSpecification::Live { data_source: None } => write!(f, "live"),
            MarketDataSpecification::Live {
                data_source: Some(source),
            } => write!(f, "live:{}", source),
            MarketDataSpecification::UserSnapshot { snapshot_id } => {
                write!(f, "snapshot:{}", snapshot_id)
            }
            MarketDataSpecification::FixedHistorical { date } => write!(f, "historical:{}", date),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Asynchronous notification from a live data provider.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveDataEvent {
    /// The subscription is established and values will flow
    SubscriptionSucceeded {
        /// Subscribed requirement
        requirement: ValueRequirement,
    },
    /// The subscription could not be established
    SubscriptionFailed {
        /// Requested requirement
        requirement: ValueRequirement,
        /// Failure reason reported by the feed
        reason: String,
    },
    /// The subscription was torn down
    SubscriptionStopped {
        /// Requirement no longer served
        requirement: ValueRequirement,
    },
    /// A new value is available for a subscribed requirement
    ValueChanged {
        /// Requirement whose value changed
        requirement: ValueRequirement,
    },
}

impl LiveDataEvent {
    /// The requirement this event is about.
    pub fn requirement(&self) -> &ValueRequirement {
        match self {
            LiveDataEvent::SubscriptionSucceeded { requirement }
            | LiveDataEvent::SubscriptionFailed { requirement, .. }
            | LiveDataEvent::SubscriptionStopped { requirement }
            | LiveDataEvent::ValueChanged { requirement } => requirement,
        }
    }
}

/// Channel on which providers push [`LiveDataEvent`]s to a listener.
pub type LiveDataEventSender = mpsc::UnboundedSender<LiveDataEvent>;

/// Receiving half of a listener channel.
pub type LiveDataEventReceiver = mpsc::UnboundedReceiver<LiveDataEvent>;

// =============================================================================
// PROVIDER TRAITS
// =============================================================================

/// A source of live data subscriptions and snapshots.
pub trait LiveDataProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Register a listener channel for subscription and value events.
    ///
    /// Listeners whose receiver has been dropped are pruned on the next send.
    fn add_listener(&self, listener: LiveDataEventSender);

    /// Request subscriptions for the given requirements.
    ///
    /// Idempotent per (user, requirement). Outcomes are reported through
    /// listener events, never through the return path.
    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]);

    /// Tear down every subscription held for `user`.
    fn unsubscribe_all(&self, _user: &UserPrincipal) {}

    /// Freeze the current values under a new snapshot id.
    fn snapshot(&self) -> Result<SnapshotId, TraitError>;

    /// Time indication of a snapshot, if the provider tracks one.
    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>>;

    /// Value of a requirement in a snapshot.
    ///
    /// Unknown or released snapshot ids yield `None`.
    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement)
        -> Option<Value>;

    /// Release a snapshot. Releasing an unknown id is a no-op.
    fn release_snapshot(&self, snapshot: SnapshotId);
}

/// Maps a [`MarketDataSpecification`] onto the provider that serves it.
pub trait MarketDataProviderResolver: Send + Sync {
    /// Resolve a provider for one specification.
    fn resolve(
        &self,
        spec: &MarketDataSpecification,
    ) -> Result<Arc<dyn LiveDataProvider>, TraitError>;
}
