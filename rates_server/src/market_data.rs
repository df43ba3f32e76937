//! Provider access: raw HTTP fetches normalized into flat field -> value rows.
//!
//! MOEX ISS answers with tables (`columns` + `data` rows) which are zipped into a
//! [`Row`] per data row; Bybit answers with a ticker object that is flattened into a
//! single [`Row`]. Every request is bounded by a connect and a read timeout and is never
//! retried: a failed fetch fails the refresh cycle and the cache decides what to serve.

use chrono::NaiveDate;
use log::{debug, warn};
use rates_common::net::{
    self, BYBIT_BASE_URL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, MOEX_BASE_URL,
};
use rates_common::{CurrencyPair, Provider, RatesError, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Provider data as seen by the pair catalogue.
///
/// `MarketDataClient` talks HTTP; tests substitute in-memory fakes.
pub trait MarketData: Send + Sync {
    /// Market data of the current (or last finished) trading session.
    fn fetch_current_session(&self, pair: &CurrencyPair) -> Result<Row>;

    /// Daily history rows in `[from, till]`, most recent session first.
    fn fetch_history_window(
        &self,
        pair: &CurrencyPair,
        from: NaiveDate,
        till: NaiveDate,
    ) -> Result<Vec<Row>>;

    /// Spot ticker snapshot.
    fn fetch_spot_ticker(&self, pair: &CurrencyPair) -> Result<Row>;
}

/// One provider record: column name -> raw JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: HashMap<String, Value>,
}

impl Row {
    /// String value of `field`, `None` when missing or not a string.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Numeric value of `field`.
    ///
    /// Numbers and numeric strings are accepted; a missing field, `null` or an empty
    /// string yield `None`. Anything else, including `NaN` and infinities, is a parse error.
    pub fn price(&self, field: &str) -> Result<Option<f64>> {
        let price = match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| RatesError::Parse(format!("{} is not a finite number", field))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|e| {
                RatesError::Parse(format!("{} value {:?} is not a number: {}", field, s, e))
            }),
            Some(other) => Err(RatesError::Parse(format!(
                "{} has unexpected value {}",
                field, other
            ))),
        }?;
        match price {
            Some(value) if !value.is_finite() => Err(RatesError::Parse(format!(
                "{} value {} is not a finite number",
                field, value
            ))),
            _ => Ok(price),
        }
    }

    /// Numeric value of `field` that must be present.
    pub fn require_price(&self, field: &str) -> Result<f64> {
        self.price(field)?
            .ok_or_else(|| RatesError::Parse(format!("missing expected field {}", field)))
    }
}

impl From<Map<String, Value>> for Row {
    fn from(object: Map<String, Value>) -> Self {
        Row {
            fields: object.into_iter().collect(),
        }
    }
}

/// Zip a column list with one data row.
pub fn zip_row(columns: &[String], values: Vec<Value>) -> Result<Row> {
    if columns.len() != values.len() {
        return Err(RatesError::Parse(format!(
            "column/row length mismatch: {} columns, {} values",
            columns.len(),
            values.len()
        )));
    }
    Ok(Row {
        fields: columns.iter().cloned().zip(values).collect(),
    })
}

#[derive(Debug, Deserialize)]
struct IssTable {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

impl IssTable {
    fn into_rows(self) -> Result<Vec<Row>> {
        let columns = self.columns;
        self.data
            .into_iter()
            .map(|values| zip_row(&columns, values))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    marketdata: IssTable,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: IssTable,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<TickerResult>,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    #[serde(default)]
    list: Vec<Map<String, Value>>,
}

/// Parse a MOEX current-session response into its single market data row.
pub fn parse_session(body: &str) -> Result<Row> {
    let response: SessionResponse = serde_json::from_str(body)?;
    response
        .marketdata
        .into_rows()?
        .into_iter()
        .next()
        .ok_or_else(|| RatesError::Parse("marketdata contains no rows".to_string()))
}

/// Parse a MOEX history response into rows, keeping the provider's order.
pub fn parse_history(body: &str) -> Result<Vec<Row>> {
    let response: HistoryResponse = serde_json::from_str(body)?;
    response.history.into_rows()
}

/// Parse a Bybit v5 spot ticker response into its single ticker row.
pub fn parse_spot_ticker(body: &str) -> Result<Row> {
    let response: TickerResponse = serde_json::from_str(body)?;
    if response.ret_code != 0 {
        return Err(RatesError::provider(
            Provider::Bybit.to_string(),
            format!("retCode {}: {}", response.ret_code, response.ret_msg),
        ));
    }
    response
        .result
        .and_then(|r| r.list.into_iter().next())
        .map(Row::from)
        .ok_or_else(|| RatesError::Parse("ticker list is empty".to_string()))
}

/// Endpoints and timeouts of the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// MOEX ISS base URL.
    pub moex_base_url: String,
    /// Bybit API base URL.
    pub bybit_base_url: String,
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on the whole request once connected.
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            moex_base_url: MOEX_BASE_URL.to_string(),
            bybit_base_url: BYBIT_BASE_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Blocking HTTP client for MOEX ISS and Bybit.
pub struct MarketDataClient {
    client: Client,
    config: ClientConfig,
}

impl MarketDataClient {
    /// Build a client with the given endpoints and timeouts.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| RatesError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn get(&self, provider: Provider, url: &str) -> Result<String> {
        debug!("{} request: {}", provider, url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| transport_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("{} answered {} for {}", provider, status, url);
            return Err(RatesError::provider(
                provider.to_string(),
                format!("HTTP {}", status),
            ));
        }
        response.text().map_err(|e| transport_error(provider, e))
    }
}

fn transport_error(provider: Provider, e: reqwest::Error) -> RatesError {
    if e.is_timeout() {
        warn!("{} request timed out: {}", provider, e);
        RatesError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        warn!("{} request failed: {}", provider, e);
        RatesError::provider(provider.to_string(), format!("Request failed: {}", e))
    }
}

fn expect_provider(pair: &CurrencyPair, expected: Provider) -> Result<()> {
    match pair.provider() {
        Some(provider) if provider == expected => Ok(()),
        _ => Err(RatesError::provider(
            expected.to_string(),
            format!("{} is not quoted by {}", pair.id, expected),
        )),
    }
}

impl MarketData for MarketDataClient {
    fn fetch_current_session(&self, pair: &CurrencyPair) -> Result<Row> {
        expect_provider(pair, Provider::Moex)?;
        let url = net::moex_session_url(&self.config.moex_base_url, &pair.ticker);
        parse_session(&self.get(Provider::Moex, &url)?)
    }

    fn fetch_history_window(
        &self,
        pair: &CurrencyPair,
        from: NaiveDate,
        till: NaiveDate,
    ) -> Result<Vec<Row>> {
        expect_provider(pair, Provider::Moex)?;
        let url = net::moex_history_url(&self.config.moex_base_url, &pair.ticker, from, till);
        parse_history(&self.get(Provider::Moex, &url)?)
    }

    fn fetch_spot_ticker(&self, pair: &CurrencyPair) -> Result<Row> {
        expect_provider(pair, Provider::Bybit)?;
        let url = net::bybit_ticker_url(&self.config.bybit_base_url, &pair.ticker);
        parse_spot_ticker(&self.get(Provider::Bybit, &url)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory `MarketData` that records every request it serves.
    use super::*;
    use std::sync::Mutex;

    /// Canned provider answers keyed by ticker.
    #[derive(Default)]
    pub(crate) struct FakeMarketData {
        pub(crate) sessions: HashMap<String, Row>,
        pub(crate) histories: HashMap<String, Vec<Row>>,
        pub(crate) tickers: HashMap<String, Row>,
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) history_windows: Mutex<Vec<(NaiveDate, NaiveDate)>>,
    }

    impl FakeMarketData {
        pub(crate) fn with_session(mut self, ticker: &str, fields: Value) -> Self {
            self.sessions.insert(ticker.to_string(), object_row(fields));
            self
        }

        pub(crate) fn with_history(mut self, ticker: &str, rows: Vec<Value>) -> Self {
            self.histories
                .insert(ticker.to_string(), rows.into_iter().map(object_row).collect());
            self
        }

        pub(crate) fn with_ticker(mut self, ticker: &str, fields: Value) -> Self {
            self.tickers.insert(ticker.to_string(), object_row(fields));
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn object_row(fields: Value) -> Row {
        match fields {
            Value::Object(map) => Row::from(map),
            other => panic!("row fixture must be an object, got {}", other),
        }
    }

    fn missing(ticker: &str) -> RatesError {
        RatesError::provider("FAKE", format!("no fixture for {}", ticker))
    }

    impl MarketData for FakeMarketData {
        fn fetch_current_session(&self, pair: &CurrencyPair) -> Result<Row> {
            self.record(format!("session:{}", pair.ticker));
            self.sessions
                .get(&pair.ticker)
                .cloned()
                .ok_or_else(|| missing(&pair.ticker))
        }

        fn fetch_history_window(
            &self,
            pair: &CurrencyPair,
            from: NaiveDate,
            till: NaiveDate,
        ) -> Result<Vec<Row>> {
            self.record(format!("history:{}", pair.ticker));
            self.history_windows.lock().unwrap().push((from, till));
            self.histories
                .get(&pair.ticker)
                .cloned()
                .ok_or_else(|| missing(&pair.ticker))
        }

        fn fetch_spot_ticker(&self, pair: &CurrencyPair) -> Result<Row> {
            self.record(format!("ticker:{}", pair.ticker));
            self.tickers
                .get(&pair.ticker)
                .cloned()
                .ok_or_else(|| missing(&pair.ticker))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rates_common::pairs::{PairGroup, PairId, Transform};
    use serde_json::json;

    const SESSION: &str = r#"{
        "marketdata": {
            "columns": ["SECID", "BOARDID", "LAST", "UPDATETIME"],
            "data": [["USD000UTSTOM", "CETS", 91.2, "18:59:58"]]
        }
    }"#;

    const HISTORY: &str = r#"{
        "history": {
            "columns": ["TRADEDATE", "SECID", "CLOSE"],
            "data": [
                ["2023-06-16", "USD000UTSTOM", 83.755],
                ["2023-06-15", "USD000UTSTOM", 84.1]
            ]
        }
    }"#;

    const TICKER: &str = r#"{
        "retCode": 0,
        "retMsg": "OK",
        "result": {
            "category": "spot",
            "list": [{"symbol": "BTCUSDT", "lastPrice": "26512.35", "volume24h": "1204.5"}]
        },
        "time": 1686912000000
    }"#;

    #[test]
    fn zips_columns_with_values() {
        let columns = vec!["SECID".to_string(), "LAST".to_string()];
        let row = zip_row(&columns, vec![json!("USD000UTSTOM"), json!("91.2")]).unwrap();
        assert_eq!(row.text("VOLUME"), None);
        assert_eq!(row.text("SECID"), Some("USD000UTSTOM"));
        assert_eq!(row.text("LAST"), Some("91.2"));
        assert_eq!(row.price("LAST").unwrap(), Some(91.2));
    }

    #[test]
    fn mismatched_lengths_are_a_parse_error() {
        let columns = vec!["SECID".to_string(), "LAST".to_string()];
        let err = zip_row(&columns, vec![json!("USD000UTSTOM")]).unwrap_err();
        assert!(err.is_parse_error());

        let body = r#"{"marketdata": {"columns": ["SECID", "LAST"], "data": [["USD000UTSTOM"]]}}"#;
        assert!(parse_session(body).unwrap_err().is_parse_error());
    }

    #[test]
    fn session_takes_the_single_row() {
        let row = parse_session(SESSION).unwrap();
        assert_eq!(row.price("LAST").unwrap(), Some(91.2));
        assert_eq!(row.text("UPDATETIME"), Some("18:59:58"));
    }

    #[test]
    fn null_last_price_is_absent() {
        let body = r#"{"marketdata": {"columns": ["SECID", "LAST"], "data": [["USD000UTSTOM", null]]}}"#;
        let row = parse_session(body).unwrap();
        assert_eq!(row.price("LAST").unwrap(), None);
        assert!(row.require_price("LAST").is_err());
    }

    #[test]
    fn empty_session_and_bad_json_fail() {
        let body = r#"{"marketdata": {"columns": ["SECID", "LAST"], "data": []}}"#;
        assert!(parse_session(body).unwrap_err().is_parse_error());
        assert!(parse_session("<html>").unwrap_err().is_parse_error());
        assert!(parse_session(r#"{"history": {"columns": [], "data": []}}"#).is_err());
    }

    #[test]
    fn history_keeps_provider_order() {
        let rows = parse_history(HISTORY).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("TRADEDATE"), Some("2023-06-16"));
        assert_eq!(rows[0].require_price("CLOSE").unwrap(), 83.755);
    }

    #[test]
    fn ticker_is_flattened() {
        let row = parse_spot_ticker(TICKER).unwrap();
        assert_eq!(row.text("symbol"), Some("BTCUSDT"));
        assert_eq!(row.require_price("lastPrice").unwrap(), 26512.35);
    }

    #[test]
    fn ticker_error_code_is_a_provider_error() {
        let body = r#"{"retCode": 10001, "retMsg": "Not supported symbols", "result": {}}"#;
        let err = parse_spot_ticker(body).unwrap_err();
        assert!(err.is_provider_error());
    }

    #[test]
    fn garbage_price_is_a_parse_error() {
        let columns = vec!["LAST".to_string()];
        let row = zip_row(&columns, vec![json!("n/a")]).unwrap();
        assert!(row.price("LAST").unwrap_err().is_parse_error());
        let row = zip_row(&columns, vec![json!([1, 2])]).unwrap();
        assert!(row.price("LAST").is_err());
    }

    #[test]
    fn non_finite_price_is_a_parse_error() {
        let columns = vec!["LAST".to_string()];
        for raw in ["NaN", "inf", "-infinity"] {
            let row = zip_row(&columns, vec![json!(raw)]).unwrap();
            let err = row.price("LAST").unwrap_err();
            assert!(err.is_parse_error(), "{}", raw);
            assert!(row.require_price("LAST").is_err());
        }
    }

    #[test]
    fn client_refuses_pairs_of_other_providers() {
        let client = MarketDataClient::new(ClientConfig::default()).unwrap();
        let derived = CurrencyPair::derived(
            PairId::RubKzt,
            PairId::KztRub,
            Transform::Reciprocal,
            "RUB",
            "KZT",
            PairGroup::Fiat,
        )
        .unwrap();
        assert!(client.fetch_current_session(&derived).unwrap_err().is_provider_error());

        let moex = CurrencyPair::exchange(PairId::UsdRub, Provider::Moex, "USD000UTSTOM", "$", "RUB", 1)
            .unwrap();
        assert!(client.fetch_spot_ticker(&moex).unwrap_err().is_provider_error());
    }
}
