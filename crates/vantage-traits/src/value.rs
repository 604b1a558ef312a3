//! Values stored in computation caches and served by live data snapshots.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why a value is absent.
///
/// Missing markers are real cache entries so that downstream nodes and the
/// delta calculator can distinguish "not computed" from "computed as missing".
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValue {
    /// Live data had no value for the requirement in the cycle's snapshot
    MissingMarketData,
    /// At least one input of the producing node was missing
    MissingInputs,
    /// The node function returned an error
    EvaluationError,
    /// The node was unchanged but failed in the previous cycle
    Suppressed,
}

impl fmt::Display for MissingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissingValue::MissingMarketData => "missing market data",
            MissingValue::MissingInputs => "missing inputs",
            MissingValue::EvaluationError => "evaluation error",
            MissingValue::Suppressed => "suppressed",
        };
        write!(f, "{}", s)
    }
}

/// A computed or sourced value.
///
/// Equality is structural; the delta calculator relies on it to decide
/// whether a market data value changed between two cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Exact decimal (prices, amounts)
    Decimal(Decimal),
    /// Floating point (model outputs)
    Float(f64),
    /// Free text
    Text(String),
    /// Ordered decimal vector (ladders, curves)
    Vector(Vec<Decimal>),
    /// Value is absent for the given reason
    Missing(MissingValue),
}

impl Value {
    /// Returns the decimal if this is a [`Value::Decimal`].
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the value as f64 where a numeric reading exists.
    pub fn as_f64(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;
        match self {
            Value::Decimal(d) => d.to_f64(),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// True if the value is a missing marker.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    /// The missing reason, if any.
    pub fn missing_reason(&self) -> Option<MissingValue> {
        match self {
            Value::Missing(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<MissingValue> for Value {
    fn from(m: MissingValue) -> Self {
        Value::Missing(m)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Vector(v) => write!(f, "[{} values]", v.len()),
            Value::Missing(m) => write!(f, "<{}>", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_value_equality_is_structural() {
        assert_eq!(Value::Decimal(dec!(1.50)), Value::from(dec!(1.50)));
        assert_ne!(Value::Decimal(dec!(1.5)), Value::Float(1.5));
        assert_ne!(
            Value::Missing(MissingValue::MissingInputs),
            Value::Missing(MissingValue::EvaluationError)
        );
    }

    #[test]
    fn test_missing_helpers() {
        let v = Value::Missing(MissingValue::Suppressed);
        assert!(v.is_missing());
        assert_eq!(v.missing_reason(), Some(MissingValue::Suppressed));
        assert_eq!(v.as_decimal(), None);
        assert_eq!(Value::Decimal(dec!(2)).as_f64(), Some(2.0));
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&Value::Missing(MissingValue::MissingMarketData)).unwrap();
        assert_eq!(json, r#"{"type":"missing","value":"missing_market_data"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Missing(MissingValue::MissingMarketData));
    }
}
