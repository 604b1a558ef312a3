//! Live data snapshot providers.
//!
//! This module provides:
//! - [`DelegatingSnapshotProvider`]: routes requirements to delegates by scheme
//! - [`PrioritizedLiveDataProvider`]: layers several providers, first value wins
//! - [`InMemoryLiveDataProvider`]: simulated feed with normalization
//! - [`normalization`]: rule pipelines turning raw ticks into canonical fields
//! - [`SingleProviderResolver`]: maps live specifications onto one provider

pub mod delegating;
pub mod in_memory;
pub mod normalization;
pub mod prioritized;
pub mod resolver;

pub use delegating::{DelegatingSnapshotProvider, DelegatingSnapshotProviderBuilder};
pub use in_memory::{InMemoryLiveDataProvider, SubscriptionState};
pub use normalization::NormalizationRuleSet;
pub use prioritized::PrioritizedLiveDataProvider;
pub use resolver::SingleProviderResolver;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use vantage_traits::market_data::{LiveDataEvent, LiveDataEventSender, LiveDataProvider};
use vantage_traits::{SnapshotId, TraitError};

/// Registered listener channels of one provider.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<LiveDataEventSender>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: LiveDataEventSender) {
        self.listeners.lock().push(listener);
    }

    /// Send to every listener, dropping those whose receiver is gone.
    pub(crate) fn send(&self, event: LiveDataEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Bookkeeping for snapshots composed of one component snapshot per provider.
pub(crate) struct CompositeSnapshots {
    next: AtomicI64,
    components: DashMap<SnapshotId, Vec<SnapshotId>>,
}

impl CompositeSnapshots {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
            components: DashMap::new(),
        }
    }

    /// Take a component snapshot from each provider, in order.
    ///
    /// On failure the components already taken are released.
    pub(crate) fn take(
        &self,
        providers: &[Arc<dyn LiveDataProvider>],
    ) -> Result<SnapshotId, TraitError> {
        let mut taken = Vec::with_capacity(providers.len());
        for provider in providers {
            match provider.snapshot() {
                Ok(id) => taken.push(id),
                Err(e) => {
                    for (p, id) in providers.iter().zip(&taken) {
                        p.release_snapshot(*id);
                    }
                    return Err(e);
                }
            }
        }
        let id = SnapshotId(self.next.fetch_add(1, Ordering::SeqCst));
        self.components.insert(id, taken);
        Ok(id)
    }

    /// Component id taken from the provider at `index`.
    pub(crate) fn component(&self, id: SnapshotId, index: usize) -> Option<SnapshotId> {
        self.components
            .get(&id)
            .and_then(|c| c.get(index).copied())
    }

    /// Release every component and forget the composite id.
    pub(crate) fn release(&self, id: SnapshotId, providers: &[Arc<dyn LiveDataProvider>]) {
        if let Some((_, taken)) = self.components.remove(&id) {
            for (provider, component) in providers.iter().zip(taken) {
                provider.release_snapshot(component);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.components.len()
    }
}

/// True if both handles point at the same provider instance.
pub(crate) fn same_provider(a: &Arc<dyn LiveDataProvider>, b: &Arc<dyn LiveDataProvider>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
