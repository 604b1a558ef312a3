//! Market data resolution over live feeds and the snapshot store.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use vantage_traits::market_data::{
    LiveDataProvider, MarketDataProviderResolver, MarketDataSpecification,
};
use vantage_traits::TraitError;

use crate::snapshot_store::{JsonSnapshotStore, SnapshotLiveDataProvider};

/// Resolves live specifications to registered feeds and user snapshots to
/// files in a [`JsonSnapshotStore`].
///
/// Each snapshot is loaded once and the provider is shared by every later
/// resolution. Historical data is not served.
pub struct FileMarketDataResolver {
    live: Arc<dyn LiveDataProvider>,
    sources: HashMap<String, Arc<dyn LiveDataProvider>>,
    store: Option<JsonSnapshotStore>,
    loaded: DashMap<String, Arc<SnapshotLiveDataProvider>>,
}

impl FileMarketDataResolver {
    /// Serve the default live source from `live`.
    pub fn new(live: Arc<dyn LiveDataProvider>) -> Self {
        Self {
            live,
            sources: HashMap::new(),
            store: None,
            loaded: DashMap::new(),
        }
    }

    /// Register a named live source.
    pub fn with_live_source(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn LiveDataProvider>,
    ) -> Self {
        self.sources.insert(name.into(), provider);
        self
    }

    /// Serve user snapshots from `store`.
    pub fn with_snapshot_store(mut self, store: JsonSnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    fn snapshot_provider(
        &self,
        snapshot_id: &str,
    ) -> Result<Arc<SnapshotLiveDataProvider>, TraitError> {
        if let Some(provider) = self.loaded.get(snapshot_id) {
            return Ok(provider.clone());
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| TraitError::SourceNotAvailable("no snapshot store configured".into()))?;

        let provider = Arc::new(SnapshotLiveDataProvider::new(store.load(snapshot_id)?));
        info!(snapshot_id, values = provider.len(), "User snapshot loaded");
        Ok(self
            .loaded
            .entry(snapshot_id.to_string())
            .or_insert(provider)
            .clone())
    }
}

impl MarketDataProviderResolver for FileMarketDataResolver {
    fn resolve(
        &self,
        spec: &MarketDataSpecification,
    ) -> Result<Arc<dyn LiveDataProvider>, TraitError> {
        match spec {
            MarketDataSpecification::Live { data_source: None } => Ok(self.live.clone()),
            MarketDataSpecification::Live {
                data_source: Some(name),
            } => self
                .sources
                .get(name)
                .cloned()
                .ok_or_else(|| TraitError::NotFound(format!("live data source {}", name))),
            MarketDataSpecification::UserSnapshot { snapshot_id } => {
                let provider: Arc<dyn LiveDataProvider> = self.snapshot_provider(snapshot_id)?;
                Ok(provider)
            }
            MarketDataSpecification::FixedHistorical { .. } => {
                Err(TraitError::SourceNotAvailable(spec.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use vantage_engine::InMemoryLiveDataProvider;
    use vantage_traits::market_data::fields;
    use vantage_traits::{ExternalId, Value, ValueRequirement};

    use crate::snapshot_store::StoredSnapshot;

    fn resolver_with_store() -> (FileMarketDataResolver, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = JsonSnapshotStore::open(dir.path()).unwrap();
        store
            .save(
                &StoredSnapshot::new("eod", Utc::now()).with_value(
                    ValueRequirement::new(fields::INDICATIVE_VALUE, ExternalId::new("SIM", "A")),
                    Value::Decimal(dec!(42)),
                ),
            )
            .unwrap();

        let resolver = FileMarketDataResolver::new(Arc::new(InMemoryLiveDataProvider::new("sim")))
            .with_live_source("backup", Arc::new(InMemoryLiveDataProvider::new("backup")))
            .with_snapshot_store(store);
        (resolver, dir)
    }

    #[test]
    fn test_live_sources() {
        let (resolver, _dir) = resolver_with_store();
        assert_eq!(resolver.resolve(&MarketDataSpecification::live()).unwrap().name(), "sim");

        let backup = MarketDataSpecification::Live {
            data_source: Some("backup".into()),
        };
        assert_eq!(resolver.resolve(&backup).unwrap().name(), "backup");

        let unknown = MarketDataSpecification::Live {
            data_source: Some("nope".into()),
        };
        assert!(matches!(resolver.resolve(&unknown), Err(TraitError::NotFound(_))));
    }

    #[test]
    fn test_user_snapshot_loaded_once() {
        let (resolver, _dir) = resolver_with_store();
        let spec = MarketDataSpecification::user_snapshot("eod");

        let first = resolver.resolve(&spec).unwrap();
        let second = resolver.resolve(&spec).unwrap();
        assert_eq!(first.name(), "snapshot:eod");
        assert!(Arc::ptr_eq(&first, &second));

        assert!(matches!(
            resolver.resolve(&MarketDataSpecification::user_snapshot("missing")),
            Err(TraitError::NotFound(_))
        ));
    }

    #[test]
    fn test_unsupported_specifications() {
        let resolver = FileMarketDataResolver::new(Arc::new(InMemoryLiveDataProvider::new("sim")));
        assert!(matches!(
            resolver.resolve(&MarketDataSpecification::user_snapshot("eod")),
            Err(TraitError::SourceNotAvailable(_))
        ));

        let historical = MarketDataSpecification::FixedHistorical {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };
        assert!(matches!(
            resolver.resolve(&historical),
            Err(TraitError::SourceNotAvailable(_))
        ));
    }
}
