use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::JobExecutionError;
use crate::registry::{JobContext, JobTarget, TargetRegistry};
use crate::store::{JobStore, Reanchor};
use crate::trigger::next_fire_time;
use crate::types::{JobRecord, JobRun, RunOutcome};

/// Attempts at writing a finished run back before giving up on it.
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_BASE: Duration = Duration::from_millis(200);
const RUN_EVENTS_CAPACITY: usize = 256;

/// Bounded pool executing job bodies off the dispatcher's path.
///
/// A submitted run waits for one of `max_workers` permits, executes with
/// panic capture and an optional timeout, then records its [`JobRun`] and
/// releases the job's in-flight slot. Nothing a job does reaches the caller.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    registry: Arc<TargetRegistry>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// run id → cancellation token of every run not yet recorded.
    active: DashMap<String, CancellationToken>,
    default_timeout: Option<Duration>,
    runs_tx: broadcast::Sender<JobRun>,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TargetRegistry>,
        max_workers: usize,
        default_timeout: Option<Duration>,
    ) -> Self {
        let (runs_tx, _) = broadcast::channel(RUN_EVENTS_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                store,
                registry,
                permits: Arc::new(Semaphore::new(max_workers.max(1))),
                tracker: TaskTracker::new(),
                active: DashMap::new(),
                default_timeout,
                runs_tx,
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Queue one run of `record` for the occurrence `scheduled_time`. The
    /// caller must already hold the job's in-flight slot (a successful
    /// claim). Returns the run id.
    pub fn submit(&self, record: JobRecord, scheduled_time: DateTime<Utc>) -> String {
        let run_id = Uuid::new_v4().to_string();
        let inner = Arc::clone(&self.inner);

        if !inner.accepting.load(Ordering::Acquire) {
            // Claimed during shutdown: record it as failed so the slot is
            // released instead of leaking until the next start.
            let now = Utc::now();
            let run = JobRun {
                id: run_id.clone(),
                job_id: record.definition.id.clone(),
                scheduled_time,
                started_at: now,
                ended_at: now,
                outcome: RunOutcome::Failure,
                error_detail: Some("worker pool is shutting down".to_string()),
            };
            self.inner.tracker.spawn(async move {
                inner.finish(run, None).await;
            });
            return run_id;
        }

        let cancel = CancellationToken::new();
        inner.active.insert(run_id.clone(), cancel.clone());
        let id = run_id.clone();
        self.inner
            .tracker
            .spawn(async move { inner.execute(record, scheduled_time, id, cancel).await });
        run_id
    }

    /// Receive every recorded run. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobRun> {
        self.inner.runs_tx.subscribe()
    }

    /// Runs submitted but not yet recorded.
    pub fn active_runs(&self) -> usize {
        self.inner.active.len()
    }

    /// Wait until every submitted run is recorded, up to `limit`. Returns
    /// false on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let tracker = &self.inner.tracker;
        tracker.close();
        let drained = tokio::time::timeout(limit, tracker.wait()).await.is_ok();
        if self.inner.accepting.load(Ordering::Acquire) {
            tracker.reopen();
        }
        drained
    }

    /// Stop taking new runs and wait up to `grace` for in-flight ones. Runs
    /// still going after that are cancelled; their results are recorded
    /// whenever they return. Returns true if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::Release);
        let tracker = &self.inner.tracker;
        tracker.close();
        let drained = tokio::time::timeout(grace, tracker.wait()).await.is_ok();
        if !drained {
            let pending = self.inner.active.len();
            warn!(pending, grace_secs = grace.as_secs(), "shutdown grace elapsed, cancelling runs");
            for entry in self.inner.active.iter() {
                entry.value().cancel();
            }
        }
        drained
    }

    /// Accept runs again after [`shutdown`](Self::shutdown).
    pub fn resume(&self) {
        self.inner.tracker.reopen();
        self.inner.accepting.store(true, Ordering::Release);
    }
}

impl PoolInner {
    async fn execute(
        self: Arc<Self>,
        record: JobRecord,
        scheduled_time: DateTime<Utc>,
        run_id: String,
        cancel: CancellationToken,
    ) {
        // The semaphore is never closed, so acquiring only fails if that changes.
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();

        let definition = &record.definition;
        let timeout = definition
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);
        let started_at = Utc::now();

        let result = match self.registry.target(&definition.target) {
            Some(target) => {
                let ctx = JobContext {
                    job_id: definition.id.clone(),
                    run_id: run_id.clone(),
                    scheduled_time,
                    args: definition.args.clone(),
                    kwargs: definition.kwargs.clone(),
                    cancel: cancel.clone(),
                };
                invoke(target, ctx, timeout, &cancel).await
            }
            None => Err(JobExecutionError::UnknownTarget {
                name: definition.target.clone(),
            }),
        };

        let ended_at = Utc::now();
        let (outcome, error_detail) = match &result {
            Ok(()) => (RunOutcome::Success, None),
            Err(e @ JobExecutionError::TimedOut { .. }) => (RunOutcome::Timeout, Some(e.to_string())),
            Err(e) => (RunOutcome::Failure, Some(e.to_string())),
        };

        match &error_detail {
            None => info!(
                job_id = %definition.id,
                run_id = %run_id,
                elapsed_ms = (ended_at - started_at).num_milliseconds(),
                "job run succeeded"
            ),
            Some(detail) => warn!(
                job_id = %definition.id,
                run_id = %run_id,
                %outcome,
                error = %detail,
                "job run failed"
            ),
        }

        let run = JobRun {
            id: run_id,
            job_id: definition.id.clone(),
            scheduled_time,
            started_at,
            ended_at,
            outcome,
            error_detail,
        };
        let reanchor = if definition.trigger.is_interval() {
            next_fire_time(&definition.trigger, ended_at).map(|next| Reanchor {
                trigger: definition.trigger.clone(),
                next,
            })
        } else {
            None
        };
        self.finish(run, reanchor).await;
    }

    /// Write the run back (bounded retries), then publish it.
    async fn finish(&self, run: JobRun, reanchor: Option<Reanchor>) {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.store.record_run(&run, reanchor.as_ref()) {
                Ok(()) => break,
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(job_id = %run.job_id, run_id = %run.id, attempt, "recording run failed, retrying: {e}");
                    tokio::time::sleep(RECORD_RETRY_BASE * attempt).await;
                }
                Err(e) => {
                    error!(job_id = %run.job_id, run_id = %run.id, "run result lost after {attempt} attempts: {e}");
                }
            }
        }
        self.active.remove(&run.id);
        // No subscribers is fine.
        let _ = self.runs_tx.send(run);
    }
}

async fn invoke(
    target: Arc<dyn JobTarget>,
    ctx: JobContext,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), JobExecutionError> {
    let body = AssertUnwindSafe(target.run(ctx)).catch_unwind();
    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, body).await {
            Ok(caught) => caught,
            Err(_) => {
                cancel.cancel();
                return Err(JobExecutionError::TimedOut {
                    secs: limit.as_secs(),
                });
            }
        },
        None => body.await,
    };

    match caught {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(JobExecutionError::Failed(format!("{e:#}"))),
        Err(payload) => Err(JobExecutionError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
