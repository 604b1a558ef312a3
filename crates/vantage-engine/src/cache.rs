//! Per-cycle computation caches.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;
use vantage_traits::{Value, ValueSpecification};

use crate::ids::CycleId;

/// Scope of one computation cache.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    /// View name
    pub view_name: String,
    /// Calculation configuration name
    pub calc_config: String,
    /// Cycle the values belong to
    pub cycle_id: CycleId,
}

/// Values computed or sourced during one cycle for one calculation configuration.
///
/// Each spec is written once per cycle. A second write overwrites the first
/// and is logged.
#[derive(Debug)]
pub struct ComputationCache {
    key: CacheKey,
    values: DashMap<ValueSpecification, Value>,
}

impl ComputationCache {
    /// Create an empty cache.
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            values: DashMap::new(),
        }
    }

    /// Scope of this cache.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Store a value.
    pub fn put(&self, spec: ValueSpecification, value: Value) {
        if let Some(previous) = self.values.insert(spec.clone(), value) {
            warn!(
                calc_config = %self.key.calc_config,
                cycle = %self.key.cycle_id,
                spec = %spec,
                previous = %previous,
                "Value written twice in one cycle, overwriting"
            );
        }
    }

    /// Read a value.
    pub fn get(&self, spec: &ValueSpecification) -> Option<Value> {
        self.values.get(spec).map(|v| v.clone())
    }

    /// True if a value is present.
    pub fn contains(&self, spec: &ValueSpecification) -> bool {
        self.values.contains_key(spec)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Creates caches per (view, calc config, cycle) and releases them per cycle.
#[derive(Debug, Default)]
pub struct ComputationCacheSource {
    caches: DashMap<CacheKey, Arc<ComputationCache>>,
}

impl ComputationCacheSource {
    /// Create an empty cache source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for the given scope, created on first use.
    pub fn get_cache(&self, view_name: &str, calc_config: &str, cycle_id: CycleId) -> Arc<ComputationCache> {
        let key = CacheKey {
            view_name: view_name.to_string(),
            calc_config: calc_config.to_string(),
            cycle_id,
        };
        self.caches
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ComputationCache::new(key)))
            .clone()
    }

    /// Existing cache for the given scope.
    pub fn find_cache(&self, view_name: &str, calc_config: &str, cycle_id: CycleId) -> Option<Arc<ComputationCache>> {
        let key = CacheKey {
            view_name: view_name.to_string(),
            calc_config: calc_config.to_string(),
            cycle_id,
        };
        self.caches.get(&key).map(|c| c.clone())
    }

    /// Drop every cache of a cycle. Returns how many were released.
    pub fn release_caches(&self, cycle_id: CycleId) -> usize {
        let before = self.caches.len();
        self.caches.retain(|key, _| key.cycle_id != cycle_id);
        before - self.caches.len()
    }

    /// Number of live caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// True if no cache is live.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use vantage_traits::{ExternalId, FunctionId};

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, ExternalId::new("POS", "1"), FunctionId::new("F"))
    }

    #[test]
    fn test_put_get() {
        let source = ComputationCacheSource::new();
        let cache = source.get_cache("View", "Default", CycleId::new());
        assert!(cache.is_empty());
        cache.put(spec("PV"), Value::Decimal(dec!(1)));
        assert_eq!(cache.get(&spec("PV")), Some(Value::Decimal(dec!(1))));
        assert!(cache.contains(&spec("PV")));
        assert_eq!(cache.get(&spec("Delta")), None);
    }

    #[test]
    fn test_second_write_overwrites() {
        let cache = ComputationCache::new(CacheKey {
            view_name: "View".into(),
            calc_config: "Default".into(),
            cycle_id: CycleId::new(),
        });
        cache.put(spec("PV"), Value::Decimal(dec!(1)));
        cache.put(spec("PV"), Value::Decimal(dec!(2)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&spec("PV")), Some(Value::Decimal(dec!(2))));
    }

    #[test]
    fn test_caches_are_scoped_and_released_per_cycle() {
        let source = ComputationCacheSource::new();
        let c1 = CycleId::new();
        let c2 = CycleId::new();
        let a = source.get_cache("View", "Default", c1);
        let b = source.get_cache("View", "Stressed", c1);
        let c = source.get_cache("View", "Default", c2);
        a.put(spec("PV"), Value::Decimal(dec!(1)));

        assert!(Arc::ptr_eq(&a, &source.get_cache("View", "Default", c1)));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(c.get(&spec("PV")), None);
        assert_eq!(source.len(), 3);

        assert_eq!(source.release_caches(c1), 2);
        assert!(source.find_cache("View", "Default", c1).is_none());
        assert!(source.find_cache("View", "Default", c2).is_some());
        assert_eq!(source.release_caches(c1), 0);
    }
}
