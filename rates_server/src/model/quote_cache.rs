//! Quote freshness cache with single-flight refresh.
//!
//! `QuoteCache` keeps the most recent `QuoteSet` together with its expiry instant. A call
//! to [`QuoteCache::get_fresh`] either returns the cached snapshot (no I/O) or takes part
//! in a refresh:
//!
//! - the first caller past expiry becomes the leader and fetches from the `QuoteSource`
//!   with the state lock released;
//! - every caller arriving while that refresh is in flight blocks on a `Condvar` and
//!   receives the leader's outcome, so concurrent demand never issues a second fetch;
//! - a successful refresh swaps in a new `Arc<QuoteSet>` and moves the expiry to
//!   `completion + ttl`; a failed one leaves snapshot and expiry untouched and the
//!   [`StalePolicy`] decides whether callers get the previous snapshot or an error.
//!
//! Snapshots are immutable and shared by `Arc`, so readers never see a half-updated set.

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use log::{debug, info, warn};
use rates_common::clock::Clock;
use rates_common::{QuoteSet, RatesError, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use strum_macros::{Display, EnumString};

/// Default lifetime of a snapshot.
pub const DEFAULT_TTL_SECS: i64 = 5 * 60;

/// Producer of complete quote sets, one call per refresh cycle.
pub trait QuoteSource: Send + Sync {
    /// Fetch and resolve every configured pair.
    fn fetch_quotes(&self) -> Result<QuoteSet>;
}

/// What callers receive when a refresh fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum StalePolicy {
    /// Serve the previous snapshot if there is one, otherwise fail.
    ServeStale,
    /// Always fail with the refresh error.
    Propagate,
}

/// Cache tuning.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// How long a snapshot is served without refreshing.
    pub ttl: Duration,
    /// Failure policy.
    pub stale_policy: StalePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
            stale_policy: StalePolicy::ServeStale,
        }
    }
}

type Outcome = std::result::Result<Arc<QuoteSet>, Arc<RatesError>>;

/// Shared mutable state; only touched with the mutex held.
#[derive(Default)]
struct CacheState {
    snapshot: Option<Arc<QuoteSet>>,
    expires_at: Option<DateTime<Utc>>,
    refreshing: bool,
    /// Number of completed refreshes, successful or not.
    generation: u64,
    /// What the refresh of `generation` handed to its callers.
    last_outcome: Option<Outcome>,
}

impl CacheState {
    fn fresh_snapshot(&self, now: DateTime<Utc>) -> Option<Arc<QuoteSet>> {
        match (&self.snapshot, self.expires_at) {
            (Some(snapshot), Some(expires_at)) if now < expires_at => Some(Arc::clone(snapshot)),
            _ => None,
        }
    }
}

/// Latest quote set with TTL expiry and coalesced refresh.
pub struct QuoteCache {
    source: Arc<dyn QuoteSource>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    refreshed: Condvar,
}

impl QuoteCache {
    /// Create an empty cache; the first `get_fresh` refreshes.
    pub fn new(source: Arc<dyn QuoteSource>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            source,
            clock,
            config,
            state: Mutex::new(CacheState::default()),
            refreshed: Condvar::new(),
        }
    }

    /// Current quote set, refreshing it first if it is missing or expired.
    ///
    /// Blocks while another caller's refresh is in flight and returns that refresh's
    /// outcome. Fails with [`RatesError::QuotesUnavailable`] when the refresh failed and
    /// the stale policy has nothing to serve.
    pub fn get_fresh(&self) -> Result<Arc<QuoteSet>> {
        let mut state = self.state.lock()?;
        loop {
            if let Some(snapshot) = state.fresh_snapshot(self.clock.now()) {
                debug!("Serving cached quotes");
                return Ok(snapshot);
            }
            if !state.refreshing {
                break;
            }

            let joined = state.generation;
            debug!("Waiting for in-flight refresh #{}", joined + 1);
            while state.refreshing && state.generation == joined {
                state = self.refreshed.wait(state)?;
            }
            if state.generation != joined {
                return match &state.last_outcome {
                    Some(outcome) => outcome.clone().map_err(RatesError::QuotesUnavailable),
                    None => Err(RatesError::MutexLock(
                        "refresh finished without an outcome".to_string(),
                    )),
                };
            }
        }

        state.refreshing = true;
        drop(state);

        let mut guard = RefreshGuard {
            cache: self,
            armed: true,
        };
        debug!("Refreshing quotes");
        let fetched = self.source.fetch_quotes();
        guard.armed = false;
        self.finish(fetched)
    }

    fn finish(&self, fetched: Result<QuoteSet>) -> Result<Arc<QuoteSet>> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let outcome: Outcome = match fetched {
            Ok(set) => {
                let snapshot = Arc::new(set);
                state.snapshot = Some(Arc::clone(&snapshot));
                state.expires_at = Some(now + self.config.ttl);
                info!(
                    "Quotes refreshed: {} pairs, valid until {}",
                    snapshot.len(),
                    now + self.config.ttl
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Quote refresh failed: {}", e);
                let cause = Arc::new(e);
                match (self.config.stale_policy, &state.snapshot) {
                    (StalePolicy::ServeStale, Some(previous)) => {
                        warn!("Serving stale quotes as of {}", previous.as_of());
                        Ok(Arc::clone(previous))
                    }
                    _ => Err(cause),
                }
            }
        };
        Self::complete(&mut state, outcome.clone());
        drop(state);
        self.refreshed.notify_all();
        outcome.map_err(RatesError::QuotesUnavailable)
    }

    fn complete(state: &mut CacheState, outcome: Outcome) {
        state.refreshing = false;
        state.generation += 1;
        state.last_outcome = Some(outcome);
    }

    // The lock is never held across foreign code.
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force the next `get_fresh` to refresh. The snapshot stays available to the
    /// stale policy.
    pub fn invalidate(&self) {
        self.lock_state().expires_at = None;
        debug!("Quote cache invalidated");
    }

    /// Latest snapshot without refreshing, fresh or not.
    pub fn snapshot(&self) -> Option<Arc<QuoteSet>> {
        self.lock_state().snapshot.clone()
    }

    /// Instant the current snapshot stops being served without a refresh.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().expires_at
    }
}

/// Releases waiters if the leader unwinds out of `QuoteSource::fetch_quotes`.
struct RefreshGuard<'a> {
    cache: &'a QuoteCache,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.cache.lock_state();
        QuoteCache::complete(
            &mut state,
            Err(Arc::new(RatesError::provider(
                "cache",
                "quote refresh panicked",
            ))),
        );
        drop(state);
        self.cache.refreshed.notify_all();
    }
}
