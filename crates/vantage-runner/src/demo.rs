//! Demo portfolio view: market data -> position values -> portfolio value.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use vantage_engine::function::{FunctionInputs, FunctionRepository, FunctionResult};
use vantage_engine::graph::{DependencyGraph, DependencyNode};
use vantage_traits::market_data::fields;
use vantage_traits::{ExternalId, TraitError, Value, ValueRequirement};

use crate::config::PositionConfig;

/// Calc config of the demo graph.
pub const CALC_CONFIG: &str = "Default";
/// Value produced per position.
pub const POSITION_VALUE: &str = "PositionValue";
/// Value produced for the whole portfolio.
pub const PORTFOLIO_VALUE: &str = "PortfolioValue";

/// Holdings used when the configuration lists none.
pub fn default_positions() -> Vec<PositionConfig> {
    [("P1", "SIM~AAPL", 100), ("P2", "SIM~MSFT", 50), ("P3", "SIM~GOOG", -25)]
        .into_iter()
        .map(|(id, target, quantity)| PositionConfig {
            id: id.to_string(),
            target: target.to_string(),
            quantity: Decimal::from(quantity),
        })
        .collect()
}

/// Target carrying the portfolio total.
pub fn portfolio_target(view_name: &str) -> ExternalId {
    ExternalId::new("PORT", view_name)
}

fn parse_positions(positions: &[PositionConfig]) -> Result<Vec<(ExternalId, ExternalId, Decimal)>> {
    if positions.is_empty() {
        bail!("no positions configured");
    }
    positions
        .iter()
        .map(|p| {
            let instrument: ExternalId = p
                .target
                .parse()
                .with_context(|| format!("position {}", p.id))?;
            Ok((ExternalId::new("POS", p.id.as_str()), instrument, p.quantity))
        })
        .collect()
}

/// Market data the demo view needs.
pub fn market_data_requirements(positions: &[PositionConfig]) -> Result<Vec<ValueRequirement>> {
    Ok(parse_positions(positions)?
        .into_iter()
        .map(|(_, instrument, _)| ValueRequirement::new(fields::INDICATIVE_VALUE, instrument))
        .collect())
}

/// Build the demo graph. Every position value and the total are terminal.
pub fn portfolio_graph(view_name: &str, positions: &[PositionConfig]) -> Result<DependencyGraph> {
    let mut b = DependencyGraph::builder(CALC_CONFIG);
    let mut total = DependencyNode::new(portfolio_target(view_name), PORTFOLIO_VALUE)
        .with_output(PORTFOLIO_VALUE);

    for (position, instrument, _) in parse_positions(positions)? {
        let md = b.add_market_data(ValueRequirement::new(fields::INDICATIVE_VALUE, instrument));
        let pv = DependencyNode::new(position, POSITION_VALUE)
            .with_input(md)
            .with_output(POSITION_VALUE);
        let pv_spec = pv.outputs[0].clone();
        b.add_node(pv);
        b.add_terminal_output(pv_spec.clone());
        total = total.with_input(pv_spec);
    }

    let total_spec = total.outputs[0].clone();
    b.add_node(total);
    b.add_terminal_output(total_spec);
    Ok(b.build()?)
}

/// Node functions of the demo graph.
pub fn functions(positions: &[PositionConfig]) -> Result<FunctionRepository> {
    let quantities: Arc<HashMap<ExternalId, Decimal>> = Arc::new(
        parse_positions(positions)?
            .into_iter()
            .map(|(position, _, quantity)| (position, quantity))
            .collect(),
    );

    Ok(FunctionRepository::new()
        .with_function(
            POSITION_VALUE,
            move |node: &DependencyNode, inputs: &FunctionInputs| -> FunctionResult {
                let quantity = quantities
                    .get(&node.target)
                    .ok_or_else(|| TraitError::NotFound(format!("quantity of {}", node.target)))?;
                let price = inputs
                    .by_name(fields::INDICATIVE_VALUE)
                    .and_then(Value::as_decimal)
                    .ok_or_else(|| TraitError::EvaluationFailed("price is not a decimal".into()))?;
                Ok(vec![Value::Decimal(price * *quantity)])
            },
        )
        .with_function(
            PORTFOLIO_VALUE,
            |_node: &DependencyNode, inputs: &FunctionInputs| -> FunctionResult {
                let total = inputs.iter().filter_map(|(_, v)| v.as_decimal()).sum::<Decimal>();
                Ok(vec![Value::Decimal(total)])
            },
        ))
}
