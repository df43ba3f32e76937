//! Provider endpoints and networking defaults.

use chrono::NaiveDate;
use std::time::Duration;

/// MOEX ISS API base URL (fiat pairs).
pub const MOEX_BASE_URL: &str = "https://iss.moex.com";
/// Bybit public API base URL (crypto spot pairs).
pub const BYBIT_BASE_URL: &str = "https://api.bybit.com";

/// Default connect timeout for every provider request.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for every provider request.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// MOEX board path shared by the current-session and history endpoints.
const MOEX_CETS_PATH: &str = "engines/currency/markets/selt/boards/CETS/securities";

/// Current (or last finished) trading session market data for `ticker`.
pub fn moex_session_url(base: &str, ticker: &str) -> String {
    format!(
        "{}/iss/{}/{}.json?iss.meta=off&iss.only=marketdata",
        base.trim_end_matches('/'),
        MOEX_CETS_PATH,
        ticker
    )
}

/// Daily history for `ticker` in the inclusive `[from, till]` range, newest first.
pub fn moex_history_url(base: &str, ticker: &str, from: NaiveDate, till: NaiveDate) -> String {
    format!(
        "{}/iss/history/{}/{}.json?iss.meta=off&from={}&till={}&sort_order=desc",
        base.trim_end_matches('/'),
        MOEX_CETS_PATH,
        ticker,
        from.format("%Y-%m-%d"),
        till.format("%Y-%m-%d")
    )
}

/// Spot ticker for `symbol`.
pub fn bybit_ticker_url(base: &str, symbol: &str) -> String {
    format!(
        "{}/v5/market/tickers?category=spot&symbol={}",
        base.trim_end_matches('/'),
        symbol
    )
}
