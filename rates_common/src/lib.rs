//!
//! Common types and utilities of the exchange-rate service.
//!
//! This crate aggregates:
//! - `error`: unified error type `RatesError` used across the workspace.
//! - `result`: handy `Result<T, RatesError>` alias.
//! - `pairs`: currency pair definitions and the built-in catalogue.
//! - `quote`: the immutable `QuoteSet` produced by a refresh cycle.
//! - `clock`: injectable wall clock.
//! - `format`: quote formatting for messages.
//! - `net`: provider endpoints and networking defaults.
#![warn(missing_docs)]
pub mod clock;
pub mod error;
pub mod format;
pub mod net;
pub mod pairs;
pub mod quote;
pub mod result;

pub use error::RatesError;
pub use pairs::{CurrencyPair, PairGroup, PairId, PairKind, Provider, Transform};
pub use quote::{PairQuote, QuoteSet};
pub use result::Result;
