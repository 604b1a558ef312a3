//! Normalization of raw vendor ticks.
//!
//! A [`NormalizationRuleSet`] is a pipeline of [`NormalizationRule`]s applied
//! to the field map of one update. Any rule may drop the update by returning
//! `None`, in which case nothing is stored or forwarded.

use std::collections::HashSet;
use std::fmt;

use rust_decimal::Decimal;
use vantage_traits::market_data::{fields, FieldMap, RawTick};

/// One step of a normalization pipeline.
pub trait NormalizationRule: Send + Sync + fmt::Debug {
    /// Transform the field map, or drop the update with `None`.
    fn apply(&self, fields: FieldMap) -> Option<FieldMap>;
}

/// Renames a vendor field.
#[derive(Debug, Clone)]
pub struct FieldNameChange {
    from: String,
    to: String,
}

impl FieldNameChange {
    /// Rename `from` to `to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl NormalizationRule for FieldNameChange {
    fn apply(&self, mut fields: FieldMap) -> Option<FieldMap> {
        if let Some(value) = fields.remove(&self.from) {
            fields.insert(self.to.clone(), value);
        }
        Some(fields)
    }
}

/// Derives the canonical indicative value.
///
/// Precedence: last trade, then mid of bid/ask, then mid of best bid/best ask.
/// Updates with none of these are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicativeValueCalculator;

impl IndicativeValueCalculator {
    fn mid(fields: &FieldMap, bid: &str, ask: &str) -> Option<Decimal> {
        match (fields.get(bid), fields.get(ask)) {
            (Some(b), Some(a)) => Some((*b + *a) / Decimal::TWO),
            _ => None,
        }
    }
}

impl NormalizationRule for IndicativeValueCalculator {
    fn apply(&self, mut fields: FieldMap) -> Option<FieldMap> {
        let value = fields
            .get(fields::LAST_PRICE)
            .copied()
            .or_else(|| Self::mid(&fields, fields::BID, fields::ASK))
            .or_else(|| Self::mid(&fields, fields::BEST_BID, fields::BEST_ASK))?;
        fields.insert(fields::INDICATIVE_VALUE.to_string(), value);
        Some(fields)
    }
}

/// Scales selected fields (e.g. pence to pounds, percent to fraction).
#[derive(Debug, Clone)]
pub struct UnitChange {
    factor: Decimal,
    fields: Vec<String>,
}

impl UnitChange {
    /// Multiply each of `fields` by `factor`.
    pub fn new(factor: Decimal, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            factor,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl NormalizationRule for UnitChange {
    fn apply(&self, mut fields: FieldMap) -> Option<FieldMap> {
        for name in &self.fields {
            if let Some(v) = fields.get_mut(name) {
                *v *= self.factor;
            }
        }
        Some(fields)
    }
}

/// Keeps only the listed fields.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    allowed: HashSet<String>,
}

impl FieldFilter {
    /// Keep only `allowed`.
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl NormalizationRule for FieldFilter {
    fn apply(&self, mut fields: FieldMap) -> Option<FieldMap> {
        fields.retain(|name, _| self.allowed.contains(name));
        Some(fields)
    }
}

/// Drops the update unless every listed field is present.
#[derive(Debug, Clone)]
pub struct RequiredFieldFilter {
    required: Vec<String>,
}

impl RequiredFieldFilter {
    /// Require all of `required`.
    pub fn new(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

impl NormalizationRule for RequiredFieldFilter {
    fn apply(&self, fields: FieldMap) -> Option<FieldMap> {
        if self.required.iter().all(|name| fields.contains_key(name)) {
            Some(fields)
        } else {
            None
        }
    }
}

// =============================================================================
// RULE SET
// =============================================================================

/// Named, ordered normalization pipeline.
#[derive(Debug)]
pub struct NormalizationRuleSet {
    id: String,
    rules: Vec<Box<dyn NormalizationRule>>,
}

impl NormalizationRuleSet {
    /// Empty rule set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rules: Vec::new(),
        }
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: impl NormalizationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Pass-through rule set.
    pub fn raw() -> Self {
        Self::new("raw")
    }

    /// Canonical rule set: derive the indicative value, keep it and volume,
    /// drop updates that produced no indicative value.
    pub fn standard() -> Self {
        Self::new("standard")
            .with_rule(IndicativeValueCalculator)
            .with_rule(FieldFilter::new([fields::INDICATIVE_VALUE, fields::VOLUME]))
            .with_rule(RequiredFieldFilter::new([fields::INDICATIVE_VALUE]))
    }

    /// Rule set identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Normalize a field map.
    pub fn normalize_fields(&self, fields: FieldMap) -> Option<FieldMap> {
        self.rules
            .iter()
            .try_fold(fields, |fields, rule| rule.apply(fields))
    }

    /// Normalize a raw tick.
    pub fn normalize(&self, tick: &RawTick) -> Option<FieldMap> {
        let normalized = self.normalize_fields(tick.fields.clone());
        if normalized.is_none() {
            tracing::trace!(target_id = %tick.target, rule_set = %self.id, "Tick dropped by normalization");
        }
        normalized
    }
}

impl Default for NormalizationRuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn map(entries: &[(&str, Decimal)]) -> FieldMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn indicative(entries: &[(&str, Decimal)]) -> Option<Decimal> {
        NormalizationRuleSet::standard()
            .normalize_fields(map(entries))
            .and_then(|f| f.get(fields::INDICATIVE_VALUE).copied())
    }

    #[test]
    fn test_last_price_wins() {
        assert_eq!(
            indicative(&[
                (fields::LAST_PRICE, dec!(100.25)),
                (fields::BID, dec!(99)),
                (fields::ASK, dec!(101)),
            ]),
            Some(dec!(100.25))
        );
    }

    #[test]
    fn test_bid_ask_mid() {
        assert_eq!(
            indicative(&[(fields::BID, dec!(99)), (fields::ASK, dec!(101))]),
            Some(dec!(100))
        );
    }

    #[test]
    fn test_best_bid_ask_mid() {
        assert_eq!(
            indicative(&[
                (fields::BID, dec!(99)),
                (fields::BEST_BID, dec!(98)),
                (fields::BEST_ASK, dec!(102)),
            ]),
            Some(dec!(100))
        );
    }

    #[test]
    fn test_update_without_price_is_dropped() {
        assert_eq!(indicative(&[(fields::BID, dec!(99))]), None);
        assert_eq!(indicative(&[(fields::VOLUME, dec!(1000))]), None);
    }

    #[test]
    fn test_standard_keeps_only_canonical_fields() {
        let out = NormalizationRuleSet::standard()
            .normalize_fields(map(&[
                (fields::LAST_PRICE, dec!(5)),
                (fields::VOLUME, dec!(7)),
                ("OPEN", dec!(4)),
            ]))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(fields::VOLUME), Some(&dec!(7)));
    }

    #[test]
    fn test_vendor_pipeline() {
        let rules = NormalizationRuleSet::new("vendor")
            .with_rule(FieldNameChange::new("PX_LAST", fields::LAST_PRICE))
            .with_rule(UnitChange::new(dec!(0.01), [fields::LAST_PRICE]))
            .with_rule(IndicativeValueCalculator)
            .with_rule(RequiredFieldFilter::new([fields::INDICATIVE_VALUE]));
        let out = rules.normalize_fields(map(&[("PX_LAST", dec!(250))])).unwrap();
        assert_eq!(out.get(fields::INDICATIVE_VALUE), Some(&dec!(2.50)));
        assert_eq!(rules.id(), "vendor");
    }

    #[test]
    fn test_raw_passes_through() {
        let input = map(&[("ANY", dec!(1))]);
        assert_eq!(NormalizationRuleSet::raw().normalize_fields(input.clone()), Some(input));
    }
}
