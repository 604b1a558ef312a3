//! Scheme-based delegation of live data.
//!
//! Every requirement is routed by the scheme of its target: to the delegate
//! registered for that scheme, or to the default delegate. The registry is
//! fixed once the provider is built.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use vantage_traits::market_data::{LiveDataEventSender, LiveDataProvider};
use vantage_traits::{Scheme, SnapshotId, TraitError, UserPrincipal, Value, ValueRequirement};

use super::{same_provider, CompositeSnapshots};

/// Builder for [`DelegatingSnapshotProvider`].
pub struct DelegatingSnapshotProviderBuilder {
    name: String,
    default: Arc<dyn LiveDataProvider>,
    by_scheme: Vec<(Scheme, Arc<dyn LiveDataProvider>)>,
}

impl DelegatingSnapshotProviderBuilder {
    /// Start from the default delegate.
    pub fn new(default: Arc<dyn LiveDataProvider>) -> Self {
        Self {
            name: "delegating".to_string(),
            default,
            by_scheme: Vec::new(),
        }
    }

    /// Set the provider name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Route `scheme` to `delegate`. A later registration for the same scheme wins.
    pub fn with_delegate(
        mut self,
        scheme: impl Into<Scheme>,
        delegate: Arc<dyn LiveDataProvider>,
    ) -> Self {
        self.by_scheme.push((scheme.into(), delegate));
        self
    }

    /// Build the provider.
    pub fn build(self) -> DelegatingSnapshotProvider {
        // Index 0 is the default; each distinct instance appears once
        let mut delegates: Vec<Arc<dyn LiveDataProvider>> = vec![self.default];
        let mut schemes = HashMap::new();
        for (scheme, delegate) in self.by_scheme {
            let index = match delegates.iter().position(|d| same_provider(d, &delegate)) {
                Some(index) => index,
                None => {
                    delegates.push(delegate);
                    delegates.len() - 1
                }
            };
            schemes.insert(scheme, index);
        }

        DelegatingSnapshotProvider {
            name: self.name,
            delegates,
            schemes,
            snapshots: CompositeSnapshots::new(),
        }
    }
}

/// Live data provider that routes each requirement to a delegate by scheme.
///
/// Snapshots are composite: one component snapshot per distinct delegate,
/// taken together so that a cycle sees every scheme at the same point.
pub struct DelegatingSnapshotProvider {
    name: String,
    delegates: Vec<Arc<dyn LiveDataProvider>>,
    schemes: HashMap<Scheme, usize>,
    snapshots: CompositeSnapshots,
}

impl DelegatingSnapshotProvider {
    /// Start building a provider around a default delegate.
    pub fn builder(default: Arc<dyn LiveDataProvider>) -> DelegatingSnapshotProviderBuilder {
        DelegatingSnapshotProviderBuilder::new(default)
    }

    fn delegate_index(&self, scheme: &Scheme) -> usize {
        self.schemes.get(scheme).copied().unwrap_or(0)
    }

    /// Delegate serving `scheme`, falling back to the default.
    pub fn choose_delegate(&self, scheme: &Scheme) -> &Arc<dyn LiveDataProvider> {
        &self.delegates[self.delegate_index(scheme)]
    }

    /// The default delegate.
    pub fn default_delegate(&self) -> &Arc<dyn LiveDataProvider> {
        &self.delegates[0]
    }

    /// Number of distinct delegates, including the default.
    pub fn delegate_count(&self) -> usize {
        self.delegates.len()
    }

    /// Subscribe to a single requirement.
    pub fn add_subscription(&self, user: &UserPrincipal, requirement: &ValueRequirement) {
        self.add_subscriptions(user, std::slice::from_ref(requirement));
    }

    /// Subscribe to a batch, grouped per delegate.
    pub fn add_subscriptions(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        let mut grouped: Vec<Vec<ValueRequirement>> = vec![Vec::new(); self.delegates.len()];
        for requirement in requirements {
            grouped[self.delegate_index(requirement.scheme())].push(requirement.clone());
        }
        for (delegate, batch) in self.delegates.iter().zip(grouped) {
            if !batch.is_empty() {
                debug!(
                    provider = %self.name,
                    delegate = delegate.name(),
                    count = batch.len(),
                    "Delegating subscriptions"
                );
                delegate.subscribe(user, &batch);
            }
        }
    }

    /// Number of composite snapshots not yet released.
    pub fn open_snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

impl LiveDataProvider for DelegatingSnapshotProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_listener(&self, listener: LiveDataEventSender) {
        for delegate in &self.delegates {
            delegate.add_listener(listener.clone());
        }
    }

    fn subscribe(&self, user: &UserPrincipal, requirements: &[ValueRequirement]) {
        self.add_subscriptions(user, requirements);
    }

    fn unsubscribe_all(&self, user: &UserPrincipal) {
        for delegate in &self.delegates {
            delegate.unsubscribe_all(user);
        }
    }

    fn snapshot(&self) -> Result<SnapshotId, TraitError> {
        self.snapshots.take(&self.delegates)
    }

    fn snapshot_time(&self, snapshot: SnapshotId) -> Option<DateTime<Utc>> {
        let component = self.snapshots.component(snapshot, 0)?;
        self.delegates[0].snapshot_time(component)
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &ValueRequirement) -> Option<Value> {
        let index = self.delegate_index(requirement.scheme());
        let component = self.snapshots.component(snapshot, index)?;
        self.delegates[index].query_snapshot(component, requirement)
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        self.snapshots.release(snapshot, &self.delegates);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_data::InMemoryLiveDataProvider;
    use rust_decimal_macros::dec;
    use vantage_traits::market_data::fields;
    use vantage_traits::ExternalId;

    fn req(scheme: &str, ticker: &str) -> ValueRequirement {
        ValueRequirement::new(fields::INDICATIVE_VALUE, ExternalId::new(scheme, ticker))
    }

    fn setup() -> (
        Arc<InMemoryLiveDataProvider>,
        Arc<InMemoryLiveDataProvider>,
        DelegatingSnapshotProvider,
    ) {
        let default = Arc::new(InMemoryLiveDataProvider::new("default"));
        let fx = Arc::new(InMemoryLiveDataProvider::new("fx"));
        let provider = DelegatingSnapshotProvider::builder(default.clone())
            .with_name("test")
            .with_delegate("FX", fx.clone())
            .build();
        (default, fx, provider)
    }

    #[test]
    fn test_choose_delegate_falls_back_to_default() {
        let (_, _, provider) = setup();
        assert_eq!(provider.choose_delegate(&Scheme::new("FX")).name(), "fx");
        assert_eq!(provider.choose_delegate(&Scheme::new("TICKER")).name(), "default");
        assert_eq!(provider.delegate_count(), 2);
    }

    #[test]
    fn test_subscriptions_reach_only_the_scheme_delegate() {
        let (default, fx, provider) = setup();
        let user = UserPrincipal::system();
        provider.add_subscription(&user, &req("FX", "EURUSD"));

        assert_eq!(fx.subscription_count(), 1);
        assert_eq!(default.subscription_count(), 0);

        provider.add_subscriptions(&user, &[req("TICKER", "A"), req("FX", "GBPUSD")]);
        assert_eq!(fx.subscription_count(), 2);
        assert_eq!(default.subscription_count(), 1);
    }

    #[test]
    fn test_composite_snapshot_routes_queries() {
        let (default, fx, provider) = setup();
        default.set_value(req("TICKER", "A"), Value::Decimal(dec!(10)));
        fx.set_value(req("FX", "EURUSD"), Value::Decimal(dec!(1.08)));
        // Same requirement on the wrong delegate must never be visible
        default.set_value(req("FX", "EURUSD"), Value::Decimal(dec!(99)));

        let snap = provider.snapshot().unwrap();
        assert_eq!(default.open_snapshot_count(), 1);
        assert_eq!(fx.open_snapshot_count(), 1);

        assert_eq!(
            provider.query_snapshot(snap, &req("FX", "EURUSD")),
            Some(Value::Decimal(dec!(1.08)))
        );
        assert_eq!(
            provider.query_snapshot(snap, &req("TICKER", "A")),
            Some(Value::Decimal(dec!(10)))
        );
        assert!(provider.snapshot_time(snap).is_some());

        provider.release_snapshot(snap);
        assert_eq!(default.open_snapshot_count(), 0);
        assert_eq!(fx.open_snapshot_count(), 0);
        assert_eq!(provider.query_snapshot(snap, &req("TICKER", "A")), None);

        provider.release_snapshot(snap);
        provider.release_snapshot(SnapshotId(12345));
        assert_eq!(provider.open_snapshot_count(), 0);
    }

    #[test]
    fn test_shared_delegate_is_snapshotted_once() {
        let default = Arc::new(InMemoryLiveDataProvider::new("default"));
        let other = Arc::new(InMemoryLiveDataProvider::new("other"));
        let provider = DelegatingSnapshotProvider::builder(default.clone())
            .with_delegate("A", other.clone())
            .with_delegate("B", other.clone())
            .with_delegate("C", default.clone())
            .build();
        assert_eq!(provider.delegate_count(), 2);

        let snap = provider.snapshot().unwrap();
        assert_eq!(other.open_snapshot_count(), 1);
        assert_eq!(default.open_snapshot_count(), 1);
        provider.release_snapshot(snap);
    }
}
