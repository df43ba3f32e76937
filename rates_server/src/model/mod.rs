//! Domain models of the rates server.
//!
//! - `quote_cache`: freshness-bounded, single-flight cache of the latest `QuoteSet`.
//! - `broadcaster`: message builders and subscriber fan-out.

pub mod broadcaster;
pub mod quote_cache;
