//! Recurring jobs anchored to a wall-clock time in a named timezone.
//!
//! A job is described by a [`ScheduleHandle`]: a daily anchor (`11:00:00 Europe/Moscow`)
//! plus a period. The first fire is the anchor today in the anchor's zone, or tomorrow if
//! that instant has already passed. After each fire the next one is computed from the
//! previous fire:
//! - whole-day periods step by calendar days in the zone, so the wall-clock time survives
//!   daylight-saving changes;
//! - any other period is added as a plain duration.
//!
//! Fires that were missed while a callback overran are skipped, never replayed. Next fires
//! stay on the grid `anchor + k * period` instead of `previous start + period`, so this is
//! fixed-rate without backfill rather than strict fixed-delay: after an overrun the job
//! waits for the next grid slot, not for a full period.
//!
//! Every job gets its own timer thread. Shutdown is signalled by disconnecting a
//! `crossbeam_channel` that each timer thread `select!`s on next to its timeout, so a
//! sleeping job wakes up immediately while a running callback is allowed to finish.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use clap::ValueEnum;
use crossbeam_channel::{Receiver, Sender, TryRecvError, after, select};
use log::{debug, error, info, warn};
use rates_common::clock::Clock;
use rates_common::{RatesError, Result};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use strum_macros::{Display, EnumString};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Time of day in a named timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyAnchor {
    /// Wall-clock time of the fire.
    pub time: NaiveTime,
    /// Zone the wall-clock time is read in.
    pub zone: Tz,
}

impl FromStr for DailyAnchor {
    type Err = RatesError;

    /// Parses `"HH:MM[:SS] Area/City"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(time), Some(zone), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RatesError::Config(format!(
                "expected \"HH:MM:SS Area/City\", got \"{}\"",
                s
            )));
        };
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
            .map_err(|e| RatesError::Config(format!("invalid time of day \"{}\": {}", time, e)))?;
        let zone = zone
            .parse::<Tz>()
            .map_err(|e| RatesError::Config(format!("unknown timezone \"{}\": {}", zone, e)))?;
        Ok(Self { time, zone })
    }
}

impl fmt::Display for DailyAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time.format("%H:%M:%S"), self.zone.name())
    }
}

/// Unit of the `--period` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PeriodUnit {
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Calendar days in the anchor zone.
    Days,
}

/// Period of `value` units; zero is rejected.
pub fn period_from(value: u32, unit: PeriodUnit) -> Result<Duration> {
    if value == 0 {
        return Err(RatesError::Config("period must be positive".to_string()));
    }
    let value = i64::from(value);
    Ok(match unit {
        PeriodUnit::Seconds => Duration::seconds(value),
        PeriodUnit::Minutes => Duration::minutes(value),
        PeriodUnit::Hours => Duration::hours(value),
        PeriodUnit::Days => Duration::days(value),
    })
}

/// Fire-time arithmetic for one recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHandle {
    anchor: DailyAnchor,
    period: Duration,
}

impl ScheduleHandle {
    /// Create a handle; the period must be positive.
    pub fn new(anchor: DailyAnchor, period: Duration) -> Result<Self> {
        if period <= Duration::zero() {
            return Err(RatesError::Config(format!(
                "period must be positive, got {}",
                period
            )));
        }
        Ok(Self { anchor, period })
    }

    /// The anchor this handle fires at.
    pub fn anchor(&self) -> DailyAnchor {
        self.anchor
    }

    /// Time between fires.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// First fire strictly after `now`.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> Result<DateTime<Tz>> {
        let today = now.with_timezone(&self.anchor.zone).date_naive();
        let candidate = self.anchor_on(today)?;
        if candidate > now {
            return Ok(candidate);
        }
        self.following_fire(candidate, now)
    }

    /// Fire after `last_fire`, skipping every slot that is not after `now`.
    pub fn following_fire(&self, last_fire: DateTime<Tz>, now: DateTime<Utc>) -> Result<DateTime<Tz>> {
        let seconds = self.period.num_seconds();
        if seconds % SECONDS_PER_DAY == 0 && self.period.subsec_nanos() == 0 {
            let days = seconds / SECONDS_PER_DAY;
            let mut date = last_fire.date_naive();
            loop {
                date = date
                    .checked_add_signed(Duration::days(days))
                    .ok_or_else(|| RatesError::Config(format!("date overflow after {}", date)))?;
                let next = self.anchor_on(date)?;
                if next > now {
                    return Ok(next);
                }
            }
        }

        let period_ms = self.period.num_milliseconds().max(1);
        let behind_ms = (now - last_fire.with_timezone(&Utc)).num_milliseconds();
        let steps = if behind_ms < 0 { 1 } else { behind_ms / period_ms + 1 };
        Ok(last_fire + Duration::milliseconds(period_ms * steps))
    }

    /// The anchor time on `date` in the anchor zone.
    ///
    /// An ambiguous local time resolves to its earliest instant. A local time that falls
    /// into a gap is moved forward by the length of the gap.
    fn anchor_on(&self, date: NaiveDate) -> Result<DateTime<Tz>> {
        let zone = self.anchor.zone;
        let local = date.and_time(self.anchor.time);
        match zone.from_local_datetime(&local) {
            LocalResult::Single(at) => Ok(at),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest),
            LocalResult::None => {
                let day_before = zone
                    .from_local_datetime(&(local - Duration::days(1)))
                    .earliest()
                    .ok_or_else(|| {
                        RatesError::Config(format!("cannot place {} in {}", local, zone.name()))
                    })?;
                let offset = i64::from(day_before.offset().fix().local_minus_utc());
                let shifted = Utc.from_utc_datetime(&(local - Duration::seconds(offset)));
                Ok(shifted.with_timezone(&zone))
            }
        }
    }
}

/// Lifecycle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// Registered, timer not started yet.
    Idle,
    /// Waiting for the given instant.
    Armed(DateTime<Utc>),
    /// Callback is running.
    Executing,
    /// Stopped; no further fires.
    Cancelled,
}

/// Identifier returned by [`RecurringScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(usize);

struct Job {
    name: String,
    state: Arc<Mutex<ScheduleState>>,
    thread: Option<JoinHandle<()>>,
}

/// Owner of all recurring jobs.
pub struct RecurringScheduler {
    clock: Arc<dyn Clock>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    jobs: Mutex<Vec<Job>>,
}

impl RecurringScheduler {
    /// Create a scheduler with no jobs.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        Self {
            clock,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Start a timer thread running `callback` at every fire of `handle`.
    pub fn schedule<F>(&self, handle: ScheduleHandle, name: &str, callback: F) -> Result<JobId>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        if self.stop_tx.lock()?.is_none() {
            return Err(RatesError::Config(format!(
                "cannot schedule '{}': scheduler is shut down",
                name
            )));
        }

        let state = Arc::new(Mutex::new(ScheduleState::Idle));
        let timer = JobTimer {
            name: name.to_string(),
            handle,
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&state),
            stop_rx: self.stop_rx.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("job-{}", name))
            .spawn(move || timer.run(callback))?;

        let mut jobs = self.jobs.lock()?;
        jobs.push(Job {
            name: name.to_string(),
            state,
            thread: Some(thread),
        });
        info!("Scheduled job '{}' at {} every {}", name, handle.anchor(), handle.period());
        Ok(JobId(jobs.len() - 1))
    }

    /// Current state of a job, `None` for an unknown id.
    pub fn state(&self, id: JobId) -> Option<ScheduleState> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(id.0)
            .map(|job| *job.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Stop every job and wait for the timer threads.
    ///
    /// A callback that is already running finishes; nothing fires afterwards.
    pub fn shutdown(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if stop_tx.is_none() {
            return;
        }
        drop(stop_tx);

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for job in jobs.iter_mut() {
            if let Some(thread) = job.thread.take() {
                if thread.join().is_err() {
                    error!("Timer thread of job '{}' terminated abnormally", job.name);
                }
            }
        }
        info!("Scheduler stopped ({} jobs)", jobs.len());
    }
}

impl Drop for RecurringScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything a timer thread owns.
struct JobTimer {
    name: String,
    handle: ScheduleHandle,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<ScheduleState>>,
    stop_rx: Receiver<()>,
}

impl JobTimer {
    fn run<F>(self, mut callback: F)
    where
        F: FnMut() -> Result<()>,
    {
        let mut next = match self.handle.next_fire_after(self.clock.now()) {
            Ok(next) => next,
            Err(e) => {
                error!("Job '{}' cannot compute its first fire: {}", self.name, e);
                self.set_state(ScheduleState::Cancelled);
                return;
            }
        };

        loop {
            let fire_at = next.with_timezone(&Utc);
            self.set_state(ScheduleState::Armed(fire_at));
            debug!("Job '{}' armed for {}", self.name, next);

            let wait = (fire_at - self.clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            select! {
                recv(self.stop_rx) -> _ => break,
                recv(after(wait)) -> _ => {}
            }
            if self.stopped() {
                break;
            }
            if self.clock.now() < fire_at {
                continue;
            }

            self.set_state(ScheduleState::Executing);
            info!("Job '{}' firing (scheduled for {})", self.name, next);
            self.invoke(&mut callback);

            next = match self.handle.following_fire(next, self.clock.now()) {
                Ok(following) => following,
                Err(e) => {
                    error!("Job '{}' cannot compute its next fire: {}", self.name, e);
                    break;
                }
            };
        }

        self.set_state(ScheduleState::Cancelled);
        info!("Job '{}' cancelled", self.name);
    }

    fn invoke<F>(&self, callback: &mut F)
    where
        F: FnMut() -> Result<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(())) => debug!("Job '{}' completed", self.name),
            Ok(Err(e)) => error!("Job '{}' failed: {}", self.name, e),
            Err(payload) => error!("Job '{}' panicked: {}", self.name, panic_text(&*payload)),
        }
    }

    fn stopped(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn set_state(&self, state: ScheduleState) {
        match self.state.lock() {
            Ok(mut current) => *current = state,
            Err(e) => {
                warn!("Job '{}' state lock poisoned", self.name);
                *e.into_inner() = state;
            }
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
