//! Quote set produced by one refresh cycle.
//!
//! A `QuoteSet` holds the per-unit quote of every resolved pair in catalogue order,
//! the instant the cycle completed and the exchange-reported session update time.
//! Once built it is never mutated; the cache hands it out behind an `Arc`.

use chrono::{DateTime, NaiveTime, Utc};

use crate::pairs::{CurrencyPair, PairGroup, PairId};

/// Resolved quote of a single pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairQuote {
    /// The pair the quote belongs to.
    pub pair: CurrencyPair,
    /// Price of one unit of `pair.first_code` in `pair.second_code`.
    pub quote: f64,
}

/// Immutable snapshot of all configured pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSet {
    quotes: Vec<PairQuote>,
    as_of: DateTime<Utc>,
    session_update_time: Option<NaiveTime>,
}

impl QuoteSet {
    /// Build a set from already-resolved quotes.
    pub fn new(
        quotes: Vec<PairQuote>,
        as_of: DateTime<Utc>,
        session_update_time: Option<NaiveTime>,
    ) -> Self {
        Self {
            quotes,
            as_of,
            session_update_time,
        }
    }

    /// Quote of `id`, if it was resolved in this cycle.
    pub fn get(&self, id: PairId) -> Option<f64> {
        self.quotes
            .iter()
            .find(|q| q.pair.id == id)
            .map(|q| q.quote)
    }

    /// All quotes in catalogue order, including hidden helper pairs.
    pub fn iter(&self) -> impl Iterator<Item = &PairQuote> {
        self.quotes.iter()
    }

    /// Broadcast-visible quotes of one group, in catalogue order.
    pub fn group(&self, group: PairGroup) -> impl Iterator<Item = &PairQuote> {
        self.quotes
            .iter()
            .filter(move |q| q.pair.group == group && q.pair.broadcast)
    }

    /// When the refresh that produced this set completed.
    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    /// Last update time reported by the fiat exchange for its current session.
    pub fn session_update_time(&self) -> Option<NaiveTime> {
        self.session_update_time
    }

    /// Number of resolved pairs.
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// True if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
