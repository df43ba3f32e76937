//! Currency pair definitions shared by the catalogue, the cache and the message builders.
//!
//! A pair is either quoted by an exchange (`PairKind::Exchange`) or derived from
//! another pair's freshly resolved quote (`PairKind::Derived`). The built-in
//! catalogue is returned by [`default_pairs`].

use clap::ValueEnum;
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::RatesError;
use crate::result::Result;

/// Identifier of every pair the service knows about.
#[allow(missing_docs)]
#[derive(
    Debug,
    Clone,
    Copy,
    ValueEnum,
    Display,
    EnumString,
    EnumIter,
    Hash,
    Eq,
    PartialEq,
)]
#[clap(rename_all = "kebab-case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PairId {
    UsdRub,
    EurRub,
    CnyRub,
    KztRub,
    TryRub,
    EurUsd,
    UsdKzt,
    RubKzt,
    BtcUsdt,
    EthUsdt,
    SolUsdt,
    WlknUsdt,
}

/// Market-data provider an exchange pair is quoted on.
#[derive(Debug, Clone, Copy, Display, Hash, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Provider {
    /// Moscow Exchange: current-session last price with previous-close fallback.
    Moex,
    /// Bybit spot market: ticker last price, always present.
    Bybit,
}

/// Pure function applied to a base pair's quote to obtain a derived quote.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transform {
    /// `1 / q`
    Reciprocal,
}

impl Transform {
    /// Apply the transform. Fails when the result would not be a finite number.
    pub fn apply(self, quote: f64) -> Result<f64> {
        match self {
            Transform::Reciprocal => {
                if quote == 0.0 || !quote.is_finite() {
                    return Err(RatesError::Parse(format!(
                        "cannot take reciprocal of quote {}",
                        quote
                    )));
                }
                Ok(1.0 / quote)
            }
        }
    }
}

/// How a pair's quote is obtained.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PairKind {
    /// Quoted directly by a provider.
    Exchange(Provider),
    /// Computed from `base`'s quote of the same refresh cycle.
    Derived {
        /// Exchange pair this one depends on.
        base: PairId,
        /// Function applied to the base quote.
        transform: Transform,
    },
}

/// Logical group a pair is broadcast in.
#[derive(Debug, Clone, Copy, Display, Hash, Eq, PartialEq)]
pub enum PairGroup {
    /// Fiat currencies quoted on MOEX (and pairs derived from them).
    Fiat,
    /// Crypto spot pairs.
    Crypto,
}

/// A tradable or derived currency pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyPair {
    /// Catalogue identifier.
    pub id: PairId,
    /// Provider-specific symbol; empty for derived pairs.
    pub ticker: String,
    /// Display code of the base currency (e.g. `$`).
    pub first_code: String,
    /// Display code of the quote currency (e.g. `RUB`).
    pub second_code: String,
    /// Lot size the provider quotes for; provider quote / face value = quote per 1 unit.
    pub face_value: u32,
    /// Resolution strategy.
    pub kind: PairKind,
    /// Message group.
    pub group: PairGroup,
    /// `false` for helper pairs resolved only as the base of a derived pair.
    pub broadcast: bool,
}

impl CurrencyPair {
    /// Create an exchange-quoted pair.
    pub fn exchange(
        id: PairId,
        provider: Provider,
        ticker: &str,
        first_code: &str,
        second_code: &str,
        face_value: u32,
    ) -> Result<Self> {
        if face_value < 1 {
            return Err(RatesError::Config(format!(
                "face value of {} must be at least 1",
                id
            )));
        }
        if ticker.trim().is_empty() {
            return Err(RatesError::Config(format!("{} has an empty ticker", id)));
        }
        let group = match provider {
            Provider::Moex => PairGroup::Fiat,
            Provider::Bybit => PairGroup::Crypto,
        };
        Ok(Self {
            id,
            ticker: ticker.to_string(),
            first_code: first_code.to_string(),
            second_code: second_code.to_string(),
            face_value,
            kind: PairKind::Exchange(provider),
            group,
            broadcast: true,
        })
    }

    /// Create a pair derived from `base` by `transform`.
    pub fn derived(
        id: PairId,
        base: PairId,
        transform: Transform,
        first_code: &str,
        second_code: &str,
        group: PairGroup,
    ) -> Result<Self> {
        if id == base {
            return Err(RatesError::Config(format!("{} cannot derive from itself", id)));
        }
        Ok(Self {
            id,
            ticker: String::new(),
            first_code: first_code.to_string(),
            second_code: second_code.to_string(),
            face_value: 1,
            kind: PairKind::Derived { base, transform },
            group,
            broadcast: true,
        })
    }

    /// Hide the pair from broadcast messages while still resolving it.
    pub fn hidden(mut self) -> Self {
        self.broadcast = false;
        self
    }

    /// Provider for exchange pairs, `None` for derived pairs.
    pub fn provider(&self) -> Option<Provider> {
        match self.kind {
            PairKind::Exchange(provider) => Some(provider),
            PairKind::Derived { .. } => None,
        }
    }

    /// True for derived pairs.
    pub fn is_derived(&self) -> bool {
        matches!(self.kind, PairKind::Derived { .. })
    }
}

/// Built-in catalogue in broadcast order.
pub fn default_pairs() -> Vec<CurrencyPair> {
    use PairId::*;
    use Provider::*;

    // Every entry has a non-empty ticker and face value >= 1.
    let moex = |id: PairId, ticker: &str, first: &str, second: &str, face: u32| {
        CurrencyPair::exchange(id, Moex, ticker, first, second, face)
    };
    let bybit = |id: PairId, ticker: &str, first: &str, second: &str| {
        CurrencyPair::exchange(id, Bybit, ticker, first, second, 1)
    };

    let pairs = [
        moex(UsdRub, "USD000UTSTOM", "$", "RUB", 1),
        moex(EurRub, "EUR_RUB__TOM", "€", "RUB", 1),
        moex(CnyRub, "CNYRUB_TOM", "CNY", "RUB", 1),
        // 100 KZT per lot; only needed as the base of RUB/KZT
        moex(KztRub, "KZTRUB_TOM", "KZT", "RUB", 100).map(CurrencyPair::hidden),
        moex(TryRub, "TRYRUB_TOM", "TRY", "RUB", 1),
        moex(EurUsd, "EURUSD000TOM", "€", "$", 1),
        moex(UsdKzt, "USDKZT_TOM", "$", "KZT", 1),
        CurrencyPair::derived(RubKzt, KztRub, Transform::Reciprocal, "RUB", "KZT", PairGroup::Fiat),
        bybit(BtcUsdt, "BTCUSDT", "BTC", "USDT"),
        bybit(EthUsdt, "ETHUSDT", "ETH", "USDT"),
        bybit(SolUsdt, "SOLUSDT", "SOL", "USDT"),
        bybit(WlknUsdt, "WLKNUSDT", "WLKN", "USDT"),
    ];
    pairs.into_iter().filter_map(|pair| pair.ok()).collect()
}

/// Subset of the built-in catalogue, pulling in the base of every selected derived pair.
pub fn select_pairs(ids: &[PairId]) -> Vec<CurrencyPair> {
    let all = default_pairs();
    let mut wanted: Vec<PairId> = ids.to_vec();
    for pair in all.iter().filter(|p| ids.contains(&p.id)) {
        if let PairKind::Derived { base, .. } = pair.kind {
            if !wanted.contains(&base) {
                wanted.push(base);
            }
        }
    }
    all.into_iter().filter(|p| wanted.contains(&p.id)).collect()
}
