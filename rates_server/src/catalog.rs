//! Pair catalogue: per-pair quote resolution rules and the full refresh cycle.
//!
//! Resolution depends on the pair kind:
//! - MOEX pairs use the current session's `LAST` price, falling back to the most recent
//!   `CLOSE` of a trailing 7-day history window when the session has no trades yet.
//! - Bybit pairs use the spot ticker's `lastPrice`.
//! - Derived pairs transform their base pair's quote from the same cycle and never fetch.
//!
//! Exchange pairs are always resolved before derived pairs. Nothing is retried here.

use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use log::{debug, info};
use rates_common::clock::Clock;
use rates_common::{
    CurrencyPair, PairGroup, PairId, PairKind, PairQuote, Provider, QuoteSet, RatesError, Result,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::market_data::MarketData;
use crate::model::quote_cache::QuoteSource;

/// Length of the history window used for the previous-close fallback. Any 7 consecutive
/// days contain at least one trading session, even around long holidays.
const HISTORY_LOOKBACK_DAYS: i64 = 7;

/// Exchange timezone used to decide what "today" is for MOEX history requests.
pub const MOEX_ZONE: Tz = chrono_tz::Europe::Moscow;

const LAST_PRICE: &str = "LAST";
const CLOSE_PRICE: &str = "CLOSE";
const UPDATE_TIME: &str = "UPDATETIME";
const SPOT_LAST_PRICE: &str = "lastPrice";

/// Outcome of resolving one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Quote per one unit of the base currency.
    pub quote: f64,
    /// Exchange-reported session update time, when the provider has one.
    pub update_time: Option<NaiveTime>,
}

impl Resolution {
    fn quote(quote: f64) -> Self {
        Self {
            quote,
            update_time: None,
        }
    }
}

/// Configured pairs plus the provider access needed to resolve them.
pub struct PairCatalog {
    pairs: Vec<CurrencyPair>,
    /// Indices into `pairs`: exchange pairs first, then derived ones.
    resolution_order: Vec<usize>,
    market_data: Arc<dyn MarketData>,
    clock: Arc<dyn Clock>,
    exchange_zone: Tz,
}

impl PairCatalog {
    /// Validate `pairs` and build a catalogue.
    ///
    /// Fails when the list is empty, contains duplicate ids, or a derived pair's base is
    /// missing or is itself derived.
    pub fn new(
        pairs: Vec<CurrencyPair>,
        market_data: Arc<dyn MarketData>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if pairs.is_empty() {
            return Err(RatesError::Config("pair catalogue is empty".to_string()));
        }
        let mut by_id: HashMap<PairId, &CurrencyPair> = HashMap::new();
        for pair in &pairs {
            if by_id.insert(pair.id, pair).is_some() {
                return Err(RatesError::Config(format!("duplicate pair {}", pair.id)));
            }
        }
        for pair in &pairs {
            if let PairKind::Derived { base, .. } = pair.kind {
                match by_id.get(&base) {
                    Some(base_pair) if !base_pair.is_derived() => {}
                    Some(_) => {
                        return Err(RatesError::Config(format!(
                            "{} derives from {} which is itself derived",
                            pair.id, base
                        )));
                    }
                    None => {
                        return Err(RatesError::Config(format!(
                            "{} derives from {} which is not configured",
                            pair.id, base
                        )));
                    }
                }
            }
        }

        let mut resolution_order: Vec<usize> = (0..pairs.len()).collect();
        resolution_order.sort_by_key(|&i| pairs[i].is_derived());

        Ok(Self {
            pairs,
            resolution_order,
            market_data,
            clock,
            exchange_zone: MOEX_ZONE,
        })
    }

    /// Configured pairs in broadcast order.
    pub fn pairs(&self) -> &[CurrencyPair] {
        &self.pairs
    }

    /// Resolve a single pair.
    ///
    /// `resolved` holds the quotes already produced in the current cycle; derived pairs
    /// read their base from it.
    pub fn resolve(
        &self,
        pair: &CurrencyPair,
        resolved: &HashMap<PairId, f64>,
    ) -> Result<Resolution> {
        match pair.kind {
            PairKind::Exchange(Provider::Moex) => self.resolve_session(pair),
            PairKind::Exchange(Provider::Bybit) => {
                let row = self.market_data.fetch_spot_ticker(pair)?;
                Ok(Resolution::quote(row.require_price(SPOT_LAST_PRICE)?))
            }
            PairKind::Derived { base, transform } => {
                let base_quote = resolved.get(&base).ok_or_else(|| {
                    RatesError::Parse(format!(
                        "{} resolved before its base pair {}",
                        pair.id, base
                    ))
                })?;
                Ok(Resolution::quote(transform.apply(*base_quote)?))
            }
        }
    }

    fn resolve_session(&self, pair: &CurrencyPair) -> Result<Resolution> {
        let face_value = f64::from(pair.face_value);
        let session = self.market_data.fetch_current_session(pair)?;
        let update_time = match session.text(UPDATE_TIME).map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(NaiveTime::parse_from_str(raw, "%H:%M:%S").map_err(|e| {
                RatesError::Parse(format!("{} of {} is {:?}: {}", UPDATE_TIME, pair.id, raw, e))
            })?),
        };

        if let Some(last) = session.price(LAST_PRICE)? {
            return Ok(Resolution {
                quote: last / face_value,
                update_time,
            });
        }

        // No trades in the current session yet: use the latest close before today.
        let today = self.clock.now().with_timezone(&self.exchange_zone).date_naive();
        let from = today - Duration::days(HISTORY_LOOKBACK_DAYS);
        let till = today - Duration::days(1);
        debug!("{} has no {}; using close of {}..{}", pair.id, LAST_PRICE, from, till);
        let history = self.market_data.fetch_history_window(pair, from, till)?;
        let latest = history.first().ok_or_else(|| {
            RatesError::Parse(format!("{} has no sessions between {} and {}", pair.id, from, till))
        })?;
        Ok(Resolution {
            quote: latest.require_price(CLOSE_PRICE)? / face_value,
            update_time,
        })
    }

    /// Run one refresh cycle over every configured pair.
    ///
    /// Fails on the first pair that cannot be resolved; a partial set is never returned.
    pub fn resolve_all(&self) -> Result<QuoteSet> {
        let mut quotes: HashMap<PairId, f64> = HashMap::with_capacity(self.pairs.len());
        let mut session_update_time = None;

        for &index in &self.resolution_order {
            let pair = &self.pairs[index];
            let resolution = self.resolve(pair, &quotes)?;
            debug!("{} resolved to {}", pair.id, resolution.quote);
            if session_update_time.is_none() && pair.group == PairGroup::Fiat {
                session_update_time = resolution.update_time;
            }
            quotes.insert(pair.id, resolution.quote);
        }

        let quotes = self
            .pairs
            .iter()
            .map(|pair| {
                quotes
                    .get(&pair.id)
                    .map(|&quote| PairQuote {
                        pair: pair.clone(),
                        quote,
                    })
                    .ok_or_else(|| RatesError::Parse(format!("{} was not resolved", pair.id)))
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Resolved {} pairs", quotes.len());
        Ok(QuoteSet::new(quotes, self.clock.now(), session_update_time))
    }
}

impl QuoteSource for PairCatalog {
    fn fetch_quotes(&self) -> Result<QuoteSet> {
        self.resolve_all()
    }
}
