use std::sync::Arc;

use vantage_traits::market_data::{
    LiveDataProvider, MarketDataProviderResolver, MarketDataSpecification,
};
use vantage_traits::TraitError;

/// Resolves live specifications to one provider and refuses everything else.
pub struct SingleProviderResolver {
    provider: Arc<dyn LiveDataProvider>,
}

impl SingleProviderResolver {
    /// Serve live data from `provider`.
    pub fn new(provider: Arc<dyn LiveDataProvider>) -> Self {
        Self { provider }
    }
}

impl MarketDataProviderResolver for SingleProviderResolver {
    fn resolve(
        &self,
        spec: &MarketDataSpecification,
    ) -> Result<Arc<dyn LiveDataProvider>, TraitError> {
        match spec {
            MarketDataSpecification::Live { .. } => Ok(self.provider.clone()),
            other => Err(TraitError::SourceNotAvailable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_data::InMemoryLiveDataProvider;

    #[test]
    fn test_only_live_resolves() {
        let resolver = SingleProviderResolver::new(Arc::new(InMemoryLiveDataProvider::new("sim")));
        let live = resolver.resolve(&MarketDataSpecification::live()).unwrap();
        assert_eq!(live.name(), "sim");
        assert!(resolver
            .resolve(&MarketDataSpecification::user_snapshot("x"))
            .is_err());
    }
}
