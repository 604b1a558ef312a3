//! In-memory live data delegate.
//!
//! Values are pushed in directly or as raw ticks that go through a
//! normalization rule set. Used as the simulated feed behind the runner and
//! as the delegate in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};
use vantage_traits::market_data::{
    LiveDataEvent, LiveDataEventSender, LiveDataProvider, RawTick,
};
use vantage_traits::{ExternalId, SnapshotId, TraitError, UserPrincipal, Value, ValueRequirement};

use super::normalization::NormalizationRuleSet;
use super::ListenerSet;
use crate::sequence::{Clock, SystemClock};

/// Upstream state of one requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Requested, outcome not yet reported
    Pending,
    /// Live
    Succeeded,
    /// Rejected by the feed
    Failed(String),
}

struct FrozenSnapshot {
    taken_at: DateTime<Utc>,
    values: HashMap<ValueRequirement, Value>,
}

/// Simulated live data feed backed by in-memory maps.
pub struct InMemoryLiveDataProvider {
    name: String,
    normalization: NormalizationRuleSet,
    clock: Arc<dyn Clock>,
    /// Latest value per requirement
    values: DashMap<ValueRequirement, Value>,
    /// Subscriptions per (user, requirement)
    subscriptions: DashSet<(UserPrincipal, ValueRequirement)>,
    /// Upstream subscription per requirement, shared by all users
    upstream: DashMap<ValueRequirement, SubscriptionState>,
    /// Targets the feed refuses to serve
    rejected: DashMap<ExternalId, String>,
    /// Hold subscription outcomes until completed explicitly
    defer_outcomes: bool,
    snapshots: DashMap<SnapshotId, FrozenSnapshot>,
    next_snapshot: AtomicI64,
    listeners: ListenerSet,
}

impl InMemoryLiveDataProvider {
    /// Create a provider with the standard normalization rule set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            normalization: NormalizationRuleSet::standard(),
            clock: Arc::new(SystemClock),
            values: DashMap::new(),
            subscriptions: DashSet::new(),
            upstream: DashMap::new(),
            rejected: DashMap::new(),
            defer_outcomes: false,
            snapshots: DashMap::new(),
            next_snapshot: AtomicI64::new(1),
            listeners: ListenerSet::default(),
        }
    }

    /// Use a different normalization rule set.
    pub fn with_normalization(mut self, rules: NormalizationRuleSet) -> Self {
        self.normalization = rules;
        self
    }

    /// Use a different clock for snapshot time indications.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Leave new subscriptions pending until
    /// [`complete_pending_subscriptions`](Self::complete_pending_subscriptions).
    pub fn with_deferred_subscriptions(mut self) -> Self {
        self.defer_outcomes = true;
        self
    }

    /// Refuse subscriptions for a target.
    pub fn reject_target(&self, target: ExternalId, reason: impl Into<String>) {
        self.rejected.insert(target, reason.into());
    }

    /// Report success for every pending subscription.
    pub fn complete_pending_subscriptions(&self) -> usize {
        let pending: Vec<ValueRequirement> = self
            .upstream
            .iter()
            .filter(|e| *e.value() == SubscriptionState::Pending)
            .map(|e| e.key().clone())
            .collect();
        for requirement in &pending {
            self.upstream
                .insert(requirement.clone(), SubscriptionState::Succeeded);
            self.listeners.send(LiveDataEvent::SubscriptionSucceeded {
                requirement: requirement.clone(),
            });
        }
        pending.len()
    }

    /// Set the latest value of a requirement.
    pub fn set_value(&self, requirement: ValueRequirement, value: Value) {
        let live = matches!(
            self.upstream.get(&requirement).as_deref(),
            Some(SubscriptionState::Succeeded)
        );
        self.values.insert(requirement.clone(), value);
        if live {
            self.listeners
                .send(LiveDataEvent::ValueChanged { requirement });
        }
    }

    /// Forget the latest value of a requirement.
    pub fn remove_value(&self, requirement: &ValueRequirement) {
        self.values.remove(requirement);
    }

    /// Normalize a raw tick and store every resulting field.
    ///
    /// Returns the number of values stored; zero when the tick was dropped.
    pub fn push_tick(&self, tick: &RawTick) -> usize {
        let Some(fields) = self.normalization.normalize(tick) else {
            return 0;
        };
        let count = fields.len();
        for (field, value) in fields {
            self.set_value(
                ValueRequirement::new(field, tick.target.clone()),
                Value::Decimal(value),
            );
        }
        trace!(provider = %self.name, target_id = %tick.target, count, "Tick applied");
        count
    }

    /// Latest value of a requirement outside any snapshot.
    pub fn latest(&self, requirement: &ValueRequirement) -> Option<Value> {
        self.values.get(requirement).map(|v| v.clone())
    }

    /// Upstream state of a requirement.
    pub fn subscription_state(&self, requirement: &ValueRequirement) -> Option<SubscriptionState> {
        self.upstream.get(requirement).map(|s| s.clone())
    }

    /// Number of (user, requirement) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of distinct upstream subscriptions.
    pub fn upstream_subscription_count(&self) -> usize {
        self.upstream.len()
    }

    /// Number of snapshots taken and not yet released.
    pub fn open_snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    fn outcome_event(requirement: &ValueRequirement, state: &SubscriptionState) -> Option<LiveDataEvent> {
        match state {
            SubscriptionState::Pending => None,
            SubscriptionState::Succeeded => Some(LiveDataEvent::SubscriptionSucceeded {
                requirement: requirement.clone(),
            }),
            SubscriptionState::Failed(reason) => Some(LiveDataEvent::SubscriptionFailed {
                requirement: requirement.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

impl LiveDataProvider for InMemoryLiveDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: LiveDataEventSender) {
        self.listeners.add(listener);
    }

    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        for requirement in requirements {
            if !self
                .subscriptions
                .insert((user.clone(), requirement.clone()))
            {
                debug!(provider = %self.name, user = %user, requirement = %requirement, "Already subscribed");
            }

            let state = self
                .upstream
                .entry(requirement.clone())
                .or_insert_with(|| {
                    if let Some(reason) = self.rejected.get(&requirement.target) {
                        SubscriptionState::Failed(reason.clone())
                    } else if self.defer_outcomes {
                        SubscriptionState::Pending
                    } else {
                        SubscriptionState::Succeeded
                    }
                })
                .clone();

            // Duplicate requests are answered with the current outcome again
            if let Some(event) = Self::outcome_event(requirement, &state) {
                self.listeners.send(event);
            }
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
            let still_used = self.subscriptions.iter().any(|e| e.key().1 == requirement);
            if !still_used && self.upstream.remove(&requirement).is_some() {
                self.listeners
                    .send(LiveDataEvent::SubscriptionStopped { requirement });
            }
        }
    }

    fn snapshot(&self) -> Result<SnapshotId, TraitError> {
        let id = SnapshotId(self.next_snapshot.fetch_add(1, Ordering::SeqCst));
        let values = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.snapshots.insert(
            id,
            FrozenSnapshot {
                taken_at: self.clock.now(),
                values,
            },
        );
        trace!(provider = %self.name, snapshot = %id, "Snapshot taken");
        Ok(id)
    }

    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>> {
        self.snapshots.get(&snapshot).map(|s| s.taken_at)
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement) -> Option<Value> {
        self.snapshots
            .get(&snapshot)
            .and_then(|s| s.values.get(requirement).cloned())
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        self.snapshots.remove(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use vantage_traits::market_data::fields;

    fn req(ticker: &str) -> ValueRequirement {
        ValueRequirement::new(fields::INDICATIVE_VALUE, ExternalId::new("SIM", ticker))
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let provider = InMemoryLiveDataProvider::new("sim");
        provider.set_value(req("A"), Value::Decimal(dec!(1)));

        let snap = provider.snapshot().unwrap();
        provider.set_value(req("A"), Value::Decimal(dec!(2)));

        assert_eq!(provider.query_snapshot(snap, &req("A")), Some(Value::Decimal(dec!(1))));
        assert_eq!(provider.latest(&req("A")), Some(Value::Decimal(dec!(2))));
        assert_eq!(provider.query_snapshot(snap, &req("B")), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let provider = InMemoryLiveDataProvider::new("sim");
        provider.set_value(req("A"), Value::Decimal(dec!(1)));
        let snap = provider.snapshot().unwrap();
        assert_eq!(provider.open_snapshot_count(), 1);

        provider.release_snapshot(snap);
        provider.release_snapshot(snap);
        provider.release_snapshot(SnapshotId(999));
        assert_eq!(provider.open_snapshot_count(), 0);
        assert_eq!(provider.query_snapshot(snap, &req("A")), None);
    }

    #[test]
    fn test_subscription_is_idempotent_per_user() {
        let provider = InMemoryLiveDataProvider::new("sim");
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.add_listener(tx);

        let alice = UserPrincipal::new("alice");
        provider.subscribe(&alice, &[req("A")]);
        provider.subscribe(&alice, &[req("A")]);
        provider.subscribe(&UserPrincipal::new("bob"), &[req("A")]);

        assert_eq!(provider.subscription_count(), 2);
        assert_eq!(provider.upstream_subscription_count(), 1);
        let mut succeeded = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, LiveDataEvent::SubscriptionSucceeded { .. }));
            succeeded += 1;
        }
        assert_eq!(succeeded, 3);
    }

    #[test]
    fn test_rejected_and_deferred_subscriptions() {
        let provider = InMemoryLiveDataProvider::new("sim").with_deferred_subscriptions();
        provider.reject_target(ExternalId::new("SIM", "BAD"), "unknown ticker");
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.add_listener(tx);

        provider.subscribe(&UserPrincipal::system(), &[req("BAD"), req("A")]);
        match rx.try_recv().unwrap() {
            LiveDataEvent::SubscriptionFailed { requirement, reason } => {
                assert_eq!(requirement, req("BAD"));
                assert_eq!(reason, "unknown ticker");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(provider.subscription_state(&req("A")), Some(SubscriptionState::Pending));

        assert_eq!(provider.complete_pending_subscriptions(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            LiveDataEvent::SubscriptionSucceeded { requirement: req("A") }
        );
    }

    #[test]
    fn test_ticks_are_normalized_and_announced() {
        let provider = InMemoryLiveDataProvider::new("sim");
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.add_listener(tx);
        provider.subscribe(&UserPrincipal::system(), &[req("A")]);
        let _ = rx.try_recv();

        let tick = RawTick::new(ExternalId::new("SIM", "A"), Utc::now())
            .with_field(fields::BID, dec!(9))
            .with_field(fields::ASK, dec!(11));
        assert_eq!(provider.push_tick(&tick), 1);
        assert_eq!(provider.latest(&req("A")), Some(Value::Decimal(dec!(10))));
        assert_eq!(rx.try_recv().unwrap(), LiveDataEvent::ValueChanged { requirement: req("A") });

        let dropped = RawTick::new(ExternalId::new("SIM", "A"), Utc::now()).with_field(fields::BID, dec!(1));
        assert_eq!(provider.push_tick(&dropped), 0);
        assert_eq!(provider.latest(&req("A")), Some(Value::Decimal(dec!(10))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_all_stops_unused_requirements() {
        let provider = InMemoryLiveDataProvider::new("sim");
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.add_listener(tx);
        let alice = UserPrincipal::new("alice");
        let bob = UserPrincipal::new("bob");
        provider.subscribe(&alice, &[req("A"), req("B")]);
        provider.subscribe(&bob, &[req("B")]);
        while rx.try_recv().is_ok() {}

        provider.unsubscribe_all(&alice);
        assert_eq!(rx.try_recv().unwrap(), LiveDataEvent::SubscriptionStopped { requirement: req("A") });
        assert!(rx.try_recv().is_err());
        assert_eq!(provider.upstream_subscription_count(), 1);
    }
}
