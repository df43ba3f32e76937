//! Command-line arguments of the rates server.
//!
//! This module defines the CLI interface using `clap` and converts it into a validated
//! [`ServiceConfig`]. Every option has a default, so the server starts with no arguments.
use chrono::Duration;
use chrono_tz::Tz;
use clap::Parser;
use rates_common::net::{BYBIT_BASE_URL, MOEX_BASE_URL};
use rates_common::pairs::{default_pairs, select_pairs};
use rates_common::{CurrencyPair, PairId, RatesError, Result};

use crate::market_data::ClientConfig;
use crate::model::quote_cache::{CacheConfig, DEFAULT_TTL_SECS, StalePolicy};
use crate::scheduler::{DailyAnchor, PeriodUnit, ScheduleHandle, period_from};

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Broadcast anchor: wall-clock time and IANA timezone, e.g. "11:00:00 Europe/Moscow".
    #[clap(long, default_value = "11:00:00 Europe/Moscow")]
    pub schedule: String,

    /// Number of period units between broadcasts.
    #[clap(long, default_value_t = 1)]
    pub period: u32,

    /// Unit of `--period`.
    #[clap(long, value_enum, default_value_t = PeriodUnit::Days)]
    pub period_unit: PeriodUnit,

    /// How long a fetched quote set is served before refreshing, in seconds.
    #[clap(long, default_value_t = DEFAULT_TTL_SECS as u64)]
    pub ttl_secs: u64,

    /// Connect timeout of provider requests, in seconds.
    #[clap(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Read timeout of provider requests, in seconds.
    #[clap(long, default_value_t = 10)]
    pub read_timeout_secs: u64,

    /// What readers get when a refresh fails.
    #[clap(long, value_enum, default_value_t = StalePolicy::ServeStale)]
    pub stale_policy: StalePolicy,

    /// Timezone used for the times shown in messages.
    #[clap(long, default_value = "Europe/Moscow")]
    pub display_zone: String,

    /// MOEX ISS base URL.
    #[clap(long, default_value = MOEX_BASE_URL)]
    pub moex_url: String,

    /// Bybit API base URL.
    #[clap(long, default_value = BYBIT_BASE_URL)]
    pub bybit_url: String,

    /// Pairs to quote, comma separated. Defaults to the whole catalogue.
    #[clap(long, value_enum, value_delimiter = ',')]
    pub pairs: Vec<PairId>,

    /// Fetch once, print the messages and exit.
    #[clap(long)]
    pub once: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Broadcast schedule.
    pub schedule: ScheduleHandle,
    /// Cache TTL and failure policy.
    pub cache: CacheConfig,
    /// Provider endpoints and timeouts.
    pub client: ClientConfig,
    /// Zone for message headers.
    pub display_zone: Tz,
    /// Pairs to resolve, in broadcast order.
    pub pairs: Vec<CurrencyPair>,
    /// Single run instead of the scheduled loop.
    pub once: bool,
}

impl ServiceConfig {
    /// Validate `args`; malformed values are reported as [`RatesError::Config`].
    pub fn from_args(args: Args) -> Result<Self> {
        let anchor: DailyAnchor = args.schedule.parse()?;
        let schedule = ScheduleHandle::new(anchor, period_from(args.period, args.period_unit)?)?;

        if args.ttl_secs == 0 {
            return Err(RatesError::Config("--ttl-secs must be positive".to_string()));
        }
        let ttl = i64::try_from(args.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| RatesError::Config(format!("--ttl-secs {} is too large", args.ttl_secs)))?;

        if args.connect_timeout_secs == 0 || args.read_timeout_secs == 0 {
            return Err(RatesError::Config("timeouts must be positive".to_string()));
        }

        let display_zone = args.display_zone.parse::<Tz>().map_err(|e| {
            RatesError::Config(format!("unknown timezone \"{}\": {}", args.display_zone, e))
        })?;

        let pairs = if args.pairs.is_empty() {
            default_pairs()
        } else {
            select_pairs(&args.pairs)
        };

        Ok(Self {
            schedule,
            cache: CacheConfig {
                ttl,
                stale_policy: args.stale_policy,
            },
            client: ClientConfig {
                moex_base_url: args.moex_url,
                bybit_base_url: args.bybit_url,
                connect_timeout: std::time::Duration::from_secs(args.connect_timeout_secs),
                read_timeout: std::time::Duration::from_secs(args.read_timeout_secs),
            },
            display_zone,
            pairs,
            once: args.once,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<ServiceConfig> {
        let mut full = vec!["rates_server"];
        full.extend_from_slice(argv);
        ServiceConfig::from_args(Args::parse_from(full))
    }

    #[test]
    fn defaults_describe_the_daily_moscow_broadcast() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.schedule.anchor().to_string(), "11:00:00 Europe/Moscow");
        assert_eq!(config.schedule.period(), Duration::days(1));
        assert_eq!(config.cache.ttl, Duration::minutes(5));
        assert_eq!(config.cache.stale_policy, StalePolicy::ServeStale);
        assert_eq!(config.client.moex_base_url, MOEX_BASE_URL);
        assert_eq!(config.client.read_timeout, std::time::Duration::from_secs(10));
        assert_eq!(config.display_zone, chrono_tz::Europe::Moscow);
        assert_eq!(config.pairs.len(), 12);
        assert!(!config.once);
    }

    #[test]
    fn options_are_applied() {
        let config = parse(&[
            "--schedule",
            "09:30 Asia/Almaty",
            "--period",
            "6",
            "--period-unit",
            "hours",
            "--ttl-secs",
            "60",
            "--stale-policy",
            "propagate",
            "--pairs",
            "usd-rub,rub-kzt",
            "--once",
        ])
        .unwrap();
        assert_eq!(config.schedule.anchor().zone, chrono_tz::Asia::Almaty);
        assert_eq!(config.schedule.period(), Duration::hours(6));
        assert_eq!(config.cache.ttl, Duration::seconds(60));
        assert_eq!(config.cache.stale_policy, StalePolicy::Propagate);
        let ids: Vec<PairId> = config.pairs.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PairId::UsdRub, PairId::KztRub, PairId::RubKzt]);
        assert!(config.once);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for argv in [
            &["--schedule", "11:00 Nowhere/City"][..],
            &["--period", "0"][..],
            &["--ttl-secs", "0"][..],
            &["--read-timeout-secs", "0"][..],
            &["--display-zone", "MSK+3"][..],
        ] {
            let err = parse(argv).unwrap_err();
            assert!(matches!(err, RatesError::Config(_)), "{:?}", argv);
        }
    }
}
