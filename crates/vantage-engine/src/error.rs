//! Engine error types.

use thiserror::Error;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// View compilation failed
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// A cycle could not be executed
    #[error("cycle execution failed: {0}")]
    CycleExecution(String),

    /// Operation not allowed in the current lifecycle state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Market data error
    #[error("market data error: {0}")]
    MarketDataError(String),

    /// No market data at all was available for a cycle
    #[error("missing market data: {0}")]
    MissingMarketData(String),

    /// Circular dependency
    #[error("circular dependency detected at {0}")]
    CircularDependency(String),

    /// Shutdown
    #[error("view process is shutting down")]
    Shutdown,

    /// Error raised by a provider, compiler or resolver
    #[error("source error: {0}")]
    Source(#[from] vantage_traits::TraitError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_traits::TraitError;

    fn resolve(found: bool) -> EngineResult<u32> {
        let value: Result<u32, TraitError> = if found {
            Ok(1)
        } else {
            Err(TraitError::SourceNotAvailable("FixedHistorical(2024-03-01)".into()))
        };
        Ok(value?)
    }

    #[test]
    fn test_trait_error_keeps_its_kind() {
        assert_eq!(resolve(true).unwrap(), 1);
        let err = resolve(false).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Source(TraitError::SourceNotAvailable(_))
        ));
        assert_eq!(
            err.to_string(),
            "source error: source not available: FixedHistorical(2024-03-01)"
        );

        let err: EngineError = TraitError::NotFound("POS~9".into()).into();
        assert!(matches!(err, EngineError::Source(TraitError::NotFound(_))));
    }
}
