//! # Vantage Traits
//!
//! Shared types and trait definitions for the Vantage view cycle engine.
//!
//! This crate holds no runtime machinery. Live data delegates, compilers and
//! the engine itself depend on it so that they agree on identifiers, values
//! and the market data provider contract.
//!
//! ## Module Structure
//!
//! - [`ids`]: Identifier types (schemes, external ids, value requirements and specifications)
//! - [`value`]: Computed and market data values, including typed missing markers
//! - [`market_data`]: The live data provider trait, subscription events and raw ticks
//! - [`config`]: Execution flags, cycle execution options and engine configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod market_data;
pub mod value;

// Re-export commonly used types
pub use error::TraitError;
pub use ids::*;
pub use value::{MissingValue, Value};
