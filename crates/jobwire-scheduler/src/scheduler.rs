use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobwire_core::SchedulerConfig;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bootstrap::{load_static_jobs, run_custom_jobs};
use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::error::{Result, SchedulerError};
use crate::registrar::Registrar;
use crate::registry::TargetRegistry;
use crate::store::{open_store, JobStore};
use crate::types::{JobRecord, JobRun};
use crate::worker::WorkerPool;

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the job store, worker pool and dispatcher loop.
///
/// Built once per process (usually via [`Scheduler::bootstrap`]) and shared
/// by reference; nothing here is a global.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registrar: Registrar,
    pool: WorkerPool,
    dispatcher: Arc<Dispatcher>,
    shutdown_grace: Duration,
    running: Mutex<Option<RunningLoop>>,
    /// Set by the first start; later starts leave in-flight counters alone
    /// since runs cancelled by `stop` may still hold them.
    started_once: AtomicBool,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, store: Arc<dyn JobStore>, registry: TargetRegistry) -> Self {
        let registry = Arc::new(registry);
        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.executor.max_workers,
            config.executor.default_timeout_secs.map(Duration::from_secs),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            pool.clone(),
            Duration::from_millis(config.tick_interval_ms.max(1)),
            Duration::from_secs(config.max_backoff_secs),
        ));
        Self {
            registrar: Registrar::new(Arc::clone(&store), registry),
            store,
            pool,
            dispatcher,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            running: Mutex::new(None),
            started_once: AtomicBool::new(false),
        }
    }

    /// Open the configured job store, register the static and custom job
    /// lists, and start ticking if `autostart` is set.
    pub async fn bootstrap(config: &SchedulerConfig, registry: TargetRegistry) -> Result<Self> {
        let store = open_store(&config.jobstore, config.run_history_limit)?;
        let scheduler = Self::new(config, store, registry);
        load_static_jobs(&scheduler.registrar, &config.jobs)?;
        run_custom_jobs(&scheduler.registrar, &config.custom)?;
        if config.autostart {
            scheduler.start()?;
        }
        Ok(scheduler)
    }

    /// Begin ticking. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.start_at(Utc::now())
    }

    /// [`start`](Self::start) with an explicit clock for the missed-fire pass.
    pub fn start_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut running = self.lock_running()?;
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        if !self.started_once.load(Ordering::Acquire) {
            let released = self.store.reset_in_flight()?;
            if released > 0 {
                warn!(jobs = released, "released in-flight slots left by a previous process");
            }
        }
        let skipped = self.dispatcher.skip_missed(now)?;

        self.pool.resume();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.dispatcher).run(shutdown_rx));
        self.started_once.store(true, Ordering::Release);
        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        info!(skipped_missed = skipped, "scheduler started");
        Ok(())
    }

    /// Stop the dispatcher, then give in-flight runs the shutdown grace
    /// period. Returns true if every run finished in time; false also when
    /// the scheduler was not running.
    pub async fn stop(&self) -> Result<bool> {
        let taken = self.lock_running()?.take();
        let Some(running) = taken else {
            return Ok(false);
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!("dispatcher task ended abnormally: {e}");
        }
        let drained = self.pool.shutdown(self.shutdown_grace).await;
        info!(drained, "scheduler stopped");
        Ok(drained)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.store.list()
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.get(job_id)
    }

    pub fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        self.store.runs(job_id, limit)
    }

    pub fn failed_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        self.store.failed_runs(limit)
    }

    pub fn subscribe_runs(&self) -> broadcast::Receiver<JobRun> {
        self.pool.subscribe()
    }

    /// Wait until no submitted run is pending, up to `limit`.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        self.pool.wait_idle(limit).await
    }

    fn lock_running(&self) -> Result<std::sync::MutexGuard<'_, Option<RunningLoop>>> {
        self.running
            .lock()
            .map_err(|_| SchedulerError::Config("scheduler state lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fn_target;
    use crate::store::MemoryJobStore;
    use crate::types::{JobDefinition, TriggerSpec};
    use std::sync::atomic::AtomicUsize;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: 20,
            shutdown_grace_secs: 1,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler() -> Scheduler {
        let registry = TargetRegistry::new().with_target("noop", fn_target(|_| async { Ok(()) }));
        Scheduler::new(&config(), Arc::new(MemoryJobStore::new(10)), registry)
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let s = scheduler();
        s.start().unwrap();
        assert!(s.is_running());
        assert!(matches!(s.start().unwrap_err(), SchedulerError::AlreadyRunning));
        assert!(s.stop().await.unwrap());
        assert!(!s.is_running());
        assert!(!s.stop().await.unwrap());
    }

    #[tokio::test]
    async fn loop_fires_interval_jobs_and_restarts() {
        let s = scheduler();
        let mut runs = s.subscribe_runs();
        s.registrar()
            .register(JobDefinition::new("fast", "noop", TriggerSpec::every_secs(1)))
            .unwrap();
        s.start().unwrap();
        let run = tokio::time::timeout(Duration::from_secs(5), runs.recv())
            .await
            .expect("a run within five seconds")
            .unwrap();
        assert_eq!(run.job_id, "fast");
        s.stop().await.unwrap();

        s.start().unwrap();
        assert!(s.is_running());
        s.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_cut_short_stop_keeps_the_slot() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        // Ignores its cancellation token.
        let registry = TargetRegistry::new().with_target(
            "stubborn",
            fn_target(move |_| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(800)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let config = SchedulerConfig {
            tick_interval_ms: 3_600_000,
            shutdown_grace_secs: 0,
            ..SchedulerConfig::default()
        };
        let s = Scheduler::new(&config, Arc::new(MemoryJobStore::new(10)), registry);
        let rec = s
            .registrar()
            .register(JobDefinition::new("slow", "stubborn", TriggerSpec::every_secs(3600)))
            .unwrap();

        s.start().unwrap();
        let first = rec.next_run_at.unwrap();
        assert_eq!(s.dispatcher().tick_at(first).unwrap().dispatched, vec!["slow"]);
        assert!(!s.stop().await.unwrap());

        s.start().unwrap();
        let rec = s.get_job("slow").unwrap().unwrap();
        assert_eq!(rec.in_flight, 1);
        let report = s.dispatcher().tick_at(rec.next_run_at.unwrap()).unwrap();
        assert!(report.dispatched.is_empty());
        assert_eq!(report.skipped_busy, vec!["slow"]);

        assert!(s.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(s.get_job("slow").unwrap().unwrap().in_flight, 0);
        s.stop().await.unwrap();
    }

    #[tokio::test]
    async fn first_start_releases_slots_left_by_a_previous_process() {
        let store = Arc::new(MemoryJobStore::new(10));
        let now = Utc::now();
        let def = JobDefinition::new("orphan", "noop", TriggerSpec::every_secs(3600));
        store.upsert(&def, Some(now), now).unwrap();
        store.claim("orphan", now, Some(now + chrono::Duration::hours(1))).unwrap();

        let registry = TargetRegistry::new().with_target("noop", fn_target(|_| async { Ok(()) }));
        let s = Scheduler::new(&config(), store.clone(), registry);
        s.start().unwrap();
        assert_eq!(s.get_job("orphan").unwrap().unwrap().in_flight, 0);
        s.stop().await.unwrap();
    }
}
