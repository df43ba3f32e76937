//! Broadcast messages and subscriber fan-out.
//!
//! The message builders turn a `QuoteSet` into the text sent to users, one message per
//! pair group. `Broadcaster` pushes those texts to every subscribed channel; the
//! transport behind a channel (and the recipients it serves) is not known here.
//!
//! Event model:
//! - `BroadcastEvent::Message(String)`: a formatted message to deliver.
//! - `BroadcastEvent::Shutdown`: signal for consumers to terminate gracefully.
//!
//! Delivery is best-effort: a subscriber whose channel is closed is dropped.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use rates_common::format::format_quote;
use rates_common::{PairGroup, QuoteSet, Result};
use std::sync::Mutex;

use crate::catalog::MOEX_ZONE;
use crate::model::quote_cache::QuoteCache;

/// Text sent instead of quotes when no quote set can be served.
const UNAVAILABLE_MESSAGE: &str =
    "Exchange rates are temporarily unavailable. Please try again in a few minutes.";

/// User-visible text for a cycle that could not produce quotes.
pub fn unavailable_message() -> &'static str {
    UNAVAILABLE_MESSAGE
}

/// Message pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// Text to deliver to every recipient.
    Message(String),
    /// Global shutdown notification for all consumers.
    Shutdown,
}

/// Fan-out of messages to subscriber channels.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<BroadcastEvent>>>,
}

impl Broadcaster {
    /// Create a broadcaster without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(tx);
        info!("Broadcaster: new subscriber. Total subscribers: {}", subscribers.len());
        rx
    }

    /// Send every message to every live subscriber; returns how many were reached.
    pub fn publish(&self, messages: &[String]) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| {
            messages
                .iter()
                .all(|text| tx.send(BroadcastEvent::Message(text.clone())).is_ok())
        });
        debug!(
            "Published {} messages to {} subscribers",
            messages.len(),
            subscribers.len()
        );
        subscribers.len()
    }

    /// Tell every subscriber to stop and forget them.
    pub fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in subscribers.drain(..) {
            let _ = tx.send(BroadcastEvent::Shutdown);
        }
    }
}

/// `HH:MM ZZZ` of `instant` in `zone`.
fn clock_label(instant: DateTime<Tz>) -> String {
    instant.format("%H:%M %Z").to_string()
}

/// Instant the fiat quotes were last updated by the exchange.
///
/// The exchange reports a Moscow wall-clock time without a date; it is placed on the
/// Moscow date of the refresh. Without one the refresh instant is used.
fn fiat_update_instant(set: &QuoteSet) -> DateTime<Utc> {
    let as_of = set.as_of();
    set.session_update_time()
        .and_then(|time| {
            let date = as_of.with_timezone(&MOEX_ZONE).date_naive();
            MOEX_ZONE.from_local_datetime(&date.and_time(time)).earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(as_of)
}

fn group_message(set: &QuoteSet, group: PairGroup, header: &str, updated: DateTime<Utc>, zone: Tz) -> String {
    let mut text = format!("{} {}:\n", header, clock_label(updated.with_timezone(&zone)));
    for quote in set.group(group) {
        text.push_str(&format!(
            "\n1 {} = {} {}",
            quote.pair.first_code,
            format_quote(quote.quote),
            quote.pair.second_code
        ));
    }
    text
}

/// Fiat rates message, stamped with the exchange session update time.
pub fn fiat_message(set: &QuoteSet, zone: Tz) -> String {
    group_message(set, PairGroup::Fiat, "Exchange rates as of", fiat_update_instant(set), zone)
}

/// Crypto rates message, stamped with the refresh time.
pub fn crypto_message(set: &QuoteSet, zone: Tz) -> String {
    group_message(set, PairGroup::Crypto, "Cryptocurrency rates as of", set.as_of(), zone)
}

/// Messages for every group that has visible pairs, fiat first.
pub fn messages(set: &QuoteSet, zone: Tz) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    if set.group(PairGroup::Fiat).next().is_some() {
        out.push(fiat_message(set, zone));
    }
    if set.group(PairGroup::Crypto).next().is_some() {
        out.push(crypto_message(set, zone));
    }
    out
}

/// One broadcast: get fresh quotes and publish the messages.
///
/// When no quotes can be served, subscribers get [`unavailable_message`] and the error is
/// returned to the caller.
pub fn broadcast_cycle(cache: &QuoteCache, broadcaster: &Broadcaster, zone: Tz) -> Result<()> {
    match cache.get_fresh() {
        Ok(set) => {
            let reached = broadcaster.publish(&messages(&set, zone));
            info!("Broadcast quotes as of {} to {} subscribers", set.as_of(), reached);
            Ok(())
        }
        Err(e) => {
            warn!("Broadcasting unavailable notice: {}", e);
            broadcaster.publish(&[unavailable_message().to_string()]);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use rates_common::clock::ManualClock;
    use rates_common::pairs::default_pairs;
    use rates_common::{PairQuote, RatesError};
    use std::sync::Arc;

    use crate::model::quote_cache::{CacheConfig, QuoteSource};

    fn sample_set() -> QuoteSet {
        let values = [91.2049, 99.5, 12.71, 0.18833, 3.8, 1.09, 483.2, 5.31, 26512.35, 1725.0, 17.2, 0.000912];
        let quotes = default_pairs()
            .into_iter()
            .zip(values)
            .map(|(pair, quote)| PairQuote { pair, quote })
            .collect();
        QuoteSet::new(
            quotes,
            // 12:30 MSK
            Utc.with_ymd_and_hms(2023, 6, 19, 9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 14, 59),
        )
    }

    #[test]
    fn fiat_message_lists_visible_fiat_pairs() {
        let text = fiat_message(&sample_set(), chrono_tz::Europe::Moscow);
        assert_eq!(
            text,
            "Exchange rates as of 12:14 MSK:\n\
             \n1 $ = 91.2 RUB\
             \n1 € = 99.5 RUB\
             \n1 CNY = 12.71 RUB\
             \n1 TRY = 3.8 RUB\
             \n1 € = 1.09 $\
             \n1 $ = 483.2 KZT\
             \n1 RUB = 5.31 KZT"
        );
    }

    #[test]
    fn crypto_message_uses_refresh_time() {
        let text = crypto_message(&sample_set(), chrono_tz::Europe::Moscow);
        assert_eq!(
            text,
            "Cryptocurrency rates as of 12:30 MSK:\n\
             \n1 BTC = 26512.35 USDT\
             \n1 ETH = 1725 USDT\
             \n1 SOL = 17.2 USDT\
             \n1 WLKN = 0.001 USDT"
        );
    }

    #[test]
    fn fiat_header_falls_back_to_refresh_time() {
        let set = sample_set();
        let set = QuoteSet::new(set.iter().cloned().collect(), set.as_of(), None);
        assert!(fiat_message(&set, chrono_tz::UTC).starts_with("Exchange rates as of 09:30 UTC:"));
    }

    #[test]
    fn publish_reaches_live_subscribers_only() {
        let broadcaster = Broadcaster::new();
        let alive = broadcaster.subscribe();
        drop(broadcaster.subscribe());

        let reached = broadcaster.publish(&["a".to_string(), "b".to_string()]);
        assert_eq!(reached, 1);
        assert_eq!(alive.try_recv().unwrap(), BroadcastEvent::Message("a".to_string()));
        assert_eq!(alive.try_recv().unwrap(), BroadcastEvent::Message("b".to_string()));

        broadcaster.shutdown();
        assert_eq!(alive.try_recv().unwrap(), BroadcastEvent::Shutdown);
        assert_eq!(broadcaster.publish(&["c".to_string()]), 0);
    }

    struct Fixed(std::result::Result<QuoteSet, ()>);

    impl QuoteSource for Fixed {
        fn fetch_quotes(&self) -> Result<QuoteSet> {
            self.0
                .clone()
                .map_err(|_| RatesError::provider("MOEX", "HTTP 502 Bad Gateway"))
        }
    }

    fn cache(source: Fixed) -> QuoteCache {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        QuoteCache::new(Arc::new(source), clock, CacheConfig::default())
    }

    #[test]
    fn cycle_publishes_both_groups() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe();
        broadcast_cycle(&cache(Fixed(Ok(sample_set()))), &broadcaster, chrono_tz::Europe::Moscow)
            .unwrap();

        let received: Vec<BroadcastEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(&received[0], BroadcastEvent::Message(m) if m.starts_with("Exchange rates")));
        assert!(matches!(&received[1], BroadcastEvent::Message(m) if m.starts_with("Cryptocurrency")));
    }

    #[test]
    fn failed_cycle_sends_unavailable_notice() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe();
        let err = broadcast_cycle(&cache(Fixed(Err(()))), &broadcaster, chrono_tz::Europe::Moscow)
            .unwrap_err();

        assert!(matches!(err, RatesError::QuotesUnavailable(_)));
        assert_eq!(
            rx.try_recv().unwrap(),
            BroadcastEvent::Message(unavailable_message().to_string())
        );
    }
}
