//! Identifier types used across the view cycle engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TraitError;

/// Separator between scheme and value in the textual form of an [`ExternalId`].
pub const EXTERNAL_ID_SEPARATOR: char = '~';

/// Identification scheme (e.g. `TICKER`, `BBG`, `SIM`).
///
/// The scheme decides which live data delegate serves a requirement.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Scheme(pub String);

impl Scheme {
    /// Create a new scheme.
    pub fn new(scheme: impl Into<String>) -> Self {
        Self(scheme.into())
    }

    /// Get the scheme as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Scheme {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Scheme {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An identifier qualified by its scheme, written `SCHEME~VALUE`.
///
/// Serialized in its textual form so it can key JSON maps.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalId {
    /// Identification scheme
    pub scheme: Scheme,
    /// Identifier within the scheme
    pub value: String,
}

impl ExternalId {
    /// Create a new external id.
    pub fn new(scheme: impl Into<Scheme>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, EXTERNAL_ID_SEPARATOR, self.value)
    }
}

impl FromStr for ExternalId {
    type Err = TraitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(EXTERNAL_ID_SEPARATOR) {
            Some((scheme, value)) if !scheme.is_empty() && !value.is_empty() => {
                Ok(Self::new(scheme, value))
            }
            _ => Err(TraitError::ParseError(format!(
                "external id must be SCHEME{}VALUE: {}",
                EXTERNAL_ID_SEPARATOR, s
            ))),
        }
    }
}

impl TryFrom<String> for ExternalId {
    type Error = TraitError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ExternalId> for String {
    fn from(id: ExternalId) -> Self {
        id.to_string()
    }
}

/// Identifier of a node function in the function repository.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FunctionId(pub String);

impl FunctionId {
    /// Function id of the synthetic nodes that source live market data.
    pub const MARKET_DATA_SOURCING: &'static str = "MarketDataSourcing";

    /// Create a new function ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The market data sourcing function id.
    pub fn market_data_sourcing() -> Self {
        Self::new(Self::MARKET_DATA_SOURCING)
    }

    /// True if this is the market data sourcing function.
    pub fn is_market_data_sourcing(&self) -> bool {
        self.0 == Self::MARKET_DATA_SOURCING
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A request for a named value on a target, independent of who produces it.
///
/// Live data subscriptions and snapshot queries are keyed by requirement.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueRequirement {
    /// Value name (e.g. `IndicativeValue`)
    pub value_name: String,
    /// Target the value is requested for
    pub target: ExternalId,
}

impl ValueRequirement {
    /// Create a new value requirement.
    pub fn new(value_name: impl Into<String>, target: ExternalId) -> Self {
        Self {
            value_name: value_name.into(),
            target,
        }
    }

    /// Scheme of the requirement's target.
    pub fn scheme(&self) -> &Scheme {
        &self.target.scheme
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)
    }
}

/// A value name on a target as produced by a specific function.
///
/// This is the key of the computation cache.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueSpecification {
    /// Value name
    pub value_name: String,
    /// Target of the value
    pub target: ExternalId,
    /// Function producing the value
    pub function_id: FunctionId,
}

impl ValueSpecification {
    /// Create a new value specification.
    pub fn new(value_name: impl Into<String>, target: ExternalId, function_id: FunctionId) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            function_id,
        }
    }

    /// The specification under which a live data requirement is sourced.
    pub fn market_data(requirement: &ValueRequirement) -> Self {
        Self::new(
            requirement.value_name.clone(),
            requirement.target.clone(),
            FunctionId::market_data_sourcing(),
        )
    }

    /// The requirement this specification satisfies.
    pub fn requirement(&self) -> ValueRequirement {
        ValueRequirement::new(self.value_name.clone(), self.target.clone())
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]<{}>", self.value_name, self.target, self.function_id)
    }
}

/// The user on whose behalf subscriptions are made.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct UserPrincipal(pub String);

impl UserPrincipal {
    /// Create a new user principal.
    pub fn new(user: impl Into<String>) -> Self {
        Self(user.into())
    }

    /// The principal used by engine-owned view processes.
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Get the user name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserPrincipal {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque handle of a point-in-time live data snapshot.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SnapshotId(pub i64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_id_round_trips_through_text() {
        let id = ExternalId::new("TICKER", "AAPL");
        assert_eq!(id.to_string(), "TICKER~AAPL");
        assert_eq!("TICKER~AAPL".parse::<ExternalId>().unwrap(), id);
    }

    #[test]
    fn test_external_id_serializes_as_text() {
        let id = ExternalId::new("SIM", "A");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""SIM~A""#);
        let back: ExternalId = serde_json::from_str(r#""SIM~A""#).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ExternalId>(r#""nope""#).is_err());
    }

    #[test]
    fn test_external_id_rejects_missing_scheme() {
        assert!("AAPL".parse::<ExternalId>().is_err());
        assert!("~AAPL".parse::<ExternalId>().is_err());
        assert!("TICKER~".parse::<ExternalId>().is_err());
    }

    #[test]
    fn test_market_data_specification() {
        let req = ValueRequirement::new("IndicativeValue", ExternalId::new("SIM", "X"));
        let spec = ValueSpecification::market_data(&req);
        assert!(spec.function_id.is_market_data_sourcing());
        assert_eq!(spec.requirement(), req);
        assert_eq!(req.scheme().as_str(), "SIM");
    }
}
