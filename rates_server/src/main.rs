//! Exchange-rate broadcast server.
//!
//! This binary quotes fiat pairs on MOEX and crypto pairs on Bybit and broadcasts them
//! once per period at a wall-clock time anchored to a timezone. Internally, it wires
//! together four building blocks:
//!
//! - `MarketDataClient`: blocking HTTP client for the provider endpoints.
//! - `PairCatalog`: per-pair resolution rules (session price, previous close fallback,
//!   spot ticker, derived pairs) and the full refresh cycle.
//! - `QuoteCache`: the latest quote set with a TTL; concurrent readers share a single
//!   in-flight refresh.
//! - `RecurringScheduler`: timer thread that runs the broadcast job at the anchor time.
//!
//! Messages are fanned out by `Broadcaster` to subscriber channels. The only subscriber
//! in this binary prints them to stdout; a chat transport would subscribe the same way.
//!
//! Shutdown: Ctrl+C stops the scheduler (a running broadcast finishes first), then
//! every subscriber receives `BroadcastEvent::Shutdown`.
#![warn(missing_docs)]
use crate::args::{Args, ServiceConfig};
use crate::catalog::PairCatalog;
use crate::market_data::MarketDataClient;
use crate::model::broadcaster::{BroadcastEvent, Broadcaster, broadcast_cycle, messages};
use crate::model::quote_cache::QuoteCache;
use crate::scheduler::RecurringScheduler;
use clap::Parser;
use crossbeam_channel::Receiver;
use log::{error, info};
use rates_common::clock::{Clock, SystemClock};
use rates_common::{RatesError, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

mod args;
mod catalog;
mod market_data;
pub mod model;
mod scheduler;

/// Name of the scheduled broadcast job.
const BROADCAST_JOB: &str = "daily-broadcast";

/// Prints every broadcast message until the broadcaster shuts down.
fn spawn_stdout_subscriber(rx: Receiver<BroadcastEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match rx.recv() {
                Ok(BroadcastEvent::Message(text)) => println!("{}\n", text),
                Ok(BroadcastEvent::Shutdown) => break,
                Err(e) => {
                    error!("Broadcast channel closed: {}", e);
                    break;
                }
            }
        }
    })
}

fn main() -> Result<()> {
    init_logger();
    let config = ServiceConfig::from_args(Args::parse())?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = Arc::new(MarketDataClient::new(config.client.clone())?);
    let catalog = PairCatalog::new(config.pairs.clone(), client, Arc::clone(&clock))?;
    info!("Quoting {} pairs", catalog.pairs().len());
    let cache = Arc::new(QuoteCache::new(Arc::new(catalog), Arc::clone(&clock), config.cache));

    if config.once {
        let set = cache.get_fresh()?;
        for message in messages(&set, config.display_zone) {
            println!("{}\n", message);
        }
        return Ok(());
    }

    let broadcaster = Arc::new(Broadcaster::new());
    let printer = spawn_stdout_subscriber(broadcaster.subscribe());

    let scheduler = RecurringScheduler::new(clock);
    let job = {
        let cache = Arc::clone(&cache);
        let broadcaster = Arc::clone(&broadcaster);
        let zone = config.display_zone;
        scheduler.schedule(config.schedule, BROADCAST_JOB, move || {
            broadcast_cycle(&cache, &broadcaster, zone)
        })?
    };

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down server...");
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| RatesError::Config(format!("cannot set Ctrl+C handler: {}", e)))?;

    info!("Server started; next broadcast at {}", config.schedule.anchor());
    if shutdown_rx.recv().is_err() {
        error!("Shutdown signal channel closed");
    }

    scheduler.shutdown();
    info!("Broadcast job state: {:?}", scheduler.state(job));
    broadcaster.shutdown();
    if printer.join().is_err() {
        error!("Stdout subscriber terminated abnormally");
    }
    info!("Server stopped");
    Ok(())
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}
