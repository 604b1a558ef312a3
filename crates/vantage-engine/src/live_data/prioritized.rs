//! Layered providers for cycles with several market data specifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use vantage_traits::market_data::{LiveDataEventSender, LiveDataProvider};
use vantage_traits::{SnapshotId, TraitError, UserPrincipal, Value, ValueRequirement};

use super::CompositeSnapshots;

/// Queries its providers in order and returns the first value found.
///
/// Subscriptions go to every provider.
pub struct PrioritizedLiveDataProvider {
    name: String,
    providers: Vec<Arc<dyn LiveDataProvider>>,
    snapshots: CompositeSnapshots,
}

impl PrioritizedLiveDataProvider {
    /// Layer `providers`, highest priority first.
    pub fn new(providers: Vec<Arc<dyn LiveDataProvider>>) -> Self {
        let name = providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("+");
        Self {
            name,
            providers,
            snapshots: CompositeSnapshots::new(),
        }
    }
}

impl LiveDataProvider for PrioritizedLiveDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: LiveDataEventSender) {
        for provider in &self.providers {
            provider.add_listener(listener.clone());
        }
    }

    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        for provider in &self.providers {
            provider.subscribe(user, requirements);
        }
    }

    fn unsubscribe_all(&self, user: &UserPrincipal) {
        for provider in &self.providers {
            provider.unsubscribe_all(user);
        }
    }

    fn snapshot(&self) -> Result<SnapshotId, TraitError> {
        self.snapshots.take(&self.providers)
    }

    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>> {
        let component = self.snapshots.component(snapshot, 0)?;
        self.providers.first()?.snapshot_time(component)
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement) -> Option<Value> {
        self.providers.iter().enumerate().find_map(|(index, provider)| {
            let component = self.snapshots.component(snapshot, index)?;
            provider.query_snapshot(component, requirement)
        })
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        self.snapshots.release(snapshot, &self.providers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_data::InMemoryLiveDataProvider;
    use rust_decimal_macros::dec;
    use vantage_traits::ExternalId;

    #[test]
    fn test_first_provider_with_a_value_wins() {
        let primary = Arc::new(InMemoryLiveDataProvider::new("primary"));
        let fallback = Arc::new(InMemoryLiveDataProvider::new("fallback"));
        let a = ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", "A"));
        let b = ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", "B"));
        primary.set_value(a.clone(), Value::Decimal(dec!(1)));
        fallback.set_value(a.clone(), Value::Decimal(dec!(2)));
        fallback.set_value(b.clone(), Value::Decimal(dec!(3)));

        let providers: Vec<Arc<dyn LiveDataProvider>> = vec![primary.clone(), fallback.clone()];
        let layered = PrioritizedLiveDataProvider::new(providers);
        assert_eq!(layered.name(), "primary+fallback");

        let snap = layered.snapshot().unwrap();
        assert_eq!(layered.query_snapshot(snap, &a), Some(Value::Decimal(dec!(1))));
        assert_eq!(layered.query_snapshot(snap, &b), Some(Value::Decimal(dec!(3))));

        layered.release_snapshot(snap);
        assert_eq!(primary.open_snapshot_count(), 0);
        assert_eq!(fallback.open_snapshot_count(), 0);
        assert_eq!(layered.query_snapshot(snap, &a), None);
    }
}
