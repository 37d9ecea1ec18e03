use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::{ClaimOutcome, JobStore};
use crate::trigger::next_fire_time;
use crate::worker::WorkerPool;

/// Where the dispatcher is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    Idle = 0,
    Evaluating = 1,
    Dispatching = 2,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DispatcherState::Evaluating,
            2 => DispatcherState::Dispatching,
            _ => DispatcherState::Idle,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Job ids handed to the worker pool, ascending.
    pub dispatched: Vec<String>,
    /// Due but still running and not concurrency-safe.
    pub skipped_busy: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.skipped_busy.is_empty()
    }
}

/// Periodic loop that finds due jobs, advances their next fire time and
/// hands them to the worker pool.
///
/// Never runs a job body itself, so one slow job cannot delay another's
/// dispatch.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pool: WorkerPool,
    state: AtomicU8,
    tick_interval: Duration,
    max_backoff: Duration,
}

/// Resets the state to `Idle` however the tick exits.
struct IdleOnDrop<'a>(&'a AtomicU8);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(DispatcherState::Idle as u8, Ordering::Release);
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: WorkerPool,
        tick_interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            state: AtomicU8::new(DispatcherState::Idle as u8),
            tick_interval,
            max_backoff,
        }
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run one tick as if the clock read `now`.
    ///
    /// Each due job gets its next fire time computed from `now` and
    /// compare-and-swapped into the store. Only a winning claim is
    /// dispatched, with the replaced fire time as its scheduled time. A store
    /// failure aborts the tick; jobs already dispatched stay dispatched.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _idle = IdleOnDrop(&self.state);
        self.set_state(DispatcherState::Evaluating);
        let due = self.store.get_due(now)?;

        self.set_state(DispatcherState::Dispatching);
        let mut report = TickReport::default();
        for record in due {
            let Some(scheduled) = record.next_run_at else {
                continue;
            };
            let next = next_fire_time(&record.definition.trigger, now);
            match self.store.claim(record.id(), scheduled, next)? {
                ClaimOutcome::Claimed => {
                    debug!(job_id = %record.id(), %scheduled, next_run = ?next, "dispatching job");
                    report.dispatched.push(record.definition.id.clone());
                    self.pool.submit(record, scheduled);
                }
                ClaimOutcome::Busy => {
                    warn!(job_id = %record.id(), %scheduled, next_run = ?next, "previous run still in flight, occurrence skipped");
                    report.skipped_busy.push(record.definition.id.clone());
                }
                ClaimOutcome::Stale => {
                    debug!(job_id = %record.id(), "job changed since it was read, left for the next tick");
                }
            }
        }
        Ok(report)
    }

    /// Move every fire time that already passed to the first one after
    /// `now`, without running it. Used on start; missed occurrences are not
    /// backfilled. Returns the number of jobs moved.
    pub fn skip_missed(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut skipped = 0;
        for record in self.store.list()? {
            let Some(missed) = record.next_run_at.filter(|at| *at < now) else {
                continue;
            };
            let next = next_fire_time(&record.definition.trigger, now);
            if self.store.reschedule(record.id(), missed, next)? {
                warn!(job_id = %record.id(), %missed, next_run = ?next, "missed fire time skipped");
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    /// Delay before retrying after `failures` consecutive store failures:
    /// the tick interval doubled per failure, capped at the max backoff.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.tick_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff.max(self.tick_interval))
    }

    /// Tick every `tick_interval` until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "dispatcher started");

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures: u32 = 0;
        let mut resume_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if resume_at.is_some_and(|at| Instant::now() < at) {
                        continue;
                    }
                    match self.tick_at(Utc::now()) {
                        Ok(report) => {
                            if failures > 0 {
                                info!(failures, "job store reachable again");
                            }
                            failures = 0;
                            resume_at = None;
                            if !report.is_empty() {
                                debug!(
                                    dispatched = report.dispatched.len(),
                                    skipped = report.skipped_busy.len(),
                                    "tick finished"
                                );
                            }
                        }
                        Err(e) if e.is_store_failure() => {
                            failures = failures.saturating_add(1);
                            let delay = self.backoff_delay(failures);
                            warn!(failures, retry_in_ms = delay.as_millis() as u64, "job store unavailable, tick skipped: {e}");
                            resume_at = Some(Instant::now() + delay);
                        }
                        Err(e) => error!("dispatcher tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
