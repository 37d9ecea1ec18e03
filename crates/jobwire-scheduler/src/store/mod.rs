//! Job persistence. The dispatcher and worker pool only talk to the
//! [`JobStore`] trait; the backend is picked by `scheduler.jobstore.backend`.

mod memory;
mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobwire_core::{JobStoreBackend, JobStoreConfig};

use crate::error::Result;
use crate::types::{JobDefinition, JobRecord, JobRun, TriggerSpec};

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Result of [`JobStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Result of [`JobStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Next fire time advanced and one in-flight slot taken: dispatch it.
    Claimed,
    /// Next fire time advanced but a run is still in flight and the job is
    /// not concurrency-safe: this occurrence is skipped.
    Busy,
    /// The stored next fire time no longer matches; another tick moved it or
    /// the job was replaced or removed.
    Stale,
}

/// Next fire time a finished interval run computed from the trigger it was
/// claimed with.
#[derive(Debug, Clone, PartialEq)]
pub struct Reanchor {
    pub trigger: TriggerSpec,
    pub next: DateTime<Utc>,
}

/// Durable key-value store of job definitions and their scheduling state.
///
/// Changes to a job's next fire time and in-flight counter happen through
/// compare-and-swap (`claim`, `reschedule`) so two ticks can never dispatch
/// the same occurrence twice.
pub trait JobStore: Send + Sync {
    /// Insert or replace a job. Fails with `DuplicateJob` when the id exists
    /// and `definition.replace_existing` is false. Replacing keeps the
    /// in-flight counter and last run time.
    fn upsert(
        &self,
        definition: &JobDefinition,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Delete a job. `JobNotFound` if no such id.
    fn remove(&self, job_id: &str) -> Result<()>;

    fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// All jobs, ascending id.
    fn list(&self) -> Result<Vec<JobRecord>>;

    /// Jobs whose next fire time is `<= as_of`, ascending id.
    fn get_due(&self, as_of: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    fn claim(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<ClaimOutcome>;

    /// Move the next fire time without claiming. Returns false when the
    /// stored value was not `expected_next`.
    fn reschedule(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Append a finished run, release its in-flight slot and set the job's
    /// last run time. `reanchor` replaces the next fire time only while the
    /// stored trigger still equals `reanchor.trigger`. A run for a job that
    /// has since been removed is still archived.
    fn record_run(&self, run: &JobRun, reanchor: Option<&Reanchor>) -> Result<()>;

    /// Newest first.
    fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;

    /// Every run whose outcome is not success, newest first.
    fn failed_runs(&self, limit: usize) -> Result<Vec<JobRun>>;

    /// Clear in-flight counters left by a previous process. Returns the number
    /// of jobs touched.
    fn reset_in_flight(&self) -> Result<usize>;
}

/// Open the backend named in `config`.
pub fn open_store(config: &JobStoreConfig, run_history_limit: usize) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match config.backend {
        JobStoreBackend::Sqlite => Arc::new(SqliteJobStore::open(
            &config.resolved_path(),
            run_history_limit,
        )?),
        JobStoreBackend::Memory => Arc::new(MemoryJobStore::new(run_history_limit)),
    };
    Ok(store)
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share. Each backend's test module calls
    //! these with a fresh store.

    use super::*;
    use crate::error::SchedulerError;
    use crate::types::{CronSpec, RunOutcome, TriggerSpec};
    use chrono::{Duration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn def(id: &str) -> JobDefinition {
        JobDefinition::new(id, "noop", TriggerSpec::Cron(CronSpec::at_minute(16)))
    }

    fn run(job_id: &str, at: DateTime<Utc>, outcome: RunOutcome) -> JobRun {
        JobRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            scheduled_time: at,
            started_at: at,
            ended_at: at + Duration::seconds(1),
            outcome,
            error_detail: (outcome != RunOutcome::Success).then(|| "boom".to_string()),
        }
    }

    pub fn duplicate_and_replace(store: &dyn JobStore) {
        let next = t0() + Duration::minutes(16);
        assert_eq!(
            store.upsert(&def("a"), Some(next), t0()).unwrap(),
            UpsertOutcome::Inserted
        );

        let err = store.upsert(&def("a"), Some(next), t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob { ref id } if id == "a"));

        let replacement = JobDefinition::new("a", "noop", TriggerSpec::every_secs(30))
            .replace_existing(true);
        let new_next = t0() + Duration::seconds(30);
        assert_eq!(
            store.upsert(&replacement, Some(new_next), t0()).unwrap(),
            UpsertOutcome::Replaced
        );
        let rec = store.get("a").unwrap().unwrap();
        assert_eq!(rec.definition.trigger, TriggerSpec::every_secs(30));
        assert_eq!(rec.next_run_at, Some(new_next));
    }

    pub fn due_order_and_remove(store: &dyn JobStore) {
        let due = t0() - Duration::seconds(1);
        for id in ["c", "a", "b"] {
            store.upsert(&def(id), Some(due), t0()).unwrap();
        }
        store
            .upsert(&def("later"), Some(t0() + Duration::hours(1)), t0())
            .unwrap();
        store.upsert(&def("never"), None, t0()).unwrap();

        let ids: Vec<String> = store
            .get_due(t0())
            .unwrap()
            .into_iter()
            .map(|r| r.definition.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        store.remove("b").unwrap();
        assert!(store.get("b").unwrap().is_none());
        assert!(matches!(
            store.remove("b").unwrap_err(),
            SchedulerError::JobNotFound { .. }
        ));
        assert_eq!(store.list().unwrap().len(), 4);
    }

    pub fn claim_is_compare_and_swap(store: &dyn JobStore) {
        let due = t0();
        let next = t0() + Duration::hours(1);
        store.upsert(&def("a"), Some(due), t0()).unwrap();

        assert_eq!(store.claim("a", due, Some(next)).unwrap(), ClaimOutcome::Claimed);
        // Second claim with the old expectation loses the race.
        assert_eq!(store.claim("a", due, Some(next)).unwrap(), ClaimOutcome::Stale);

        // Next occurrence while the first run is still in flight.
        let after = next + Duration::hours(1);
        assert_eq!(store.claim("a", next, Some(after)).unwrap(), ClaimOutcome::Busy);
        let rec = store.get("a").unwrap().unwrap();
        assert_eq!(rec.in_flight, 1);
        assert_eq!(rec.next_run_at, Some(after));

        assert_eq!(store.claim("missing", due, None).unwrap(), ClaimOutcome::Stale);
    }

    pub fn concurrency_safe_jobs_stack(store: &dyn JobStore) {
        let d = def("a").concurrency_safe(true);
        let first = t0();
        let second = t0() + Duration::hours(1);
        store.upsert(&d, Some(first), t0()).unwrap();
        assert_eq!(store.claim("a", first, Some(second)).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.claim("a", second, None).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.get("a").unwrap().unwrap().in_flight, 2);
    }

    pub fn record_run_releases_and_reanchors(store: &dyn JobStore) {
        let due = t0();
        let interval = JobDefinition::new("a", "noop", TriggerSpec::every_secs(30));
        store.upsert(&interval, Some(due), t0()).unwrap();
        store.claim("a", due, Some(due + Duration::hours(1))).unwrap();

        let r = run("a", due, RunOutcome::Failure);
        let reanchor = Reanchor {
            trigger: TriggerSpec::every_secs(30),
            next: r.ended_at + Duration::seconds(30),
        };
        store.record_run(&r, Some(&reanchor)).unwrap();

        let rec = store.get("a").unwrap().unwrap();
        assert_eq!(rec.in_flight, 0);
        assert_eq!(rec.last_run_at, Some(r.ended_at));
        assert_eq!(rec.next_run_at, Some(reanchor.next));

        let runs = store.runs("a", 10).unwrap();
        assert_eq!(runs, vec![r.clone()]);
        assert_eq!(store.failed_runs(10).unwrap(), vec![r]);
    }

    pub fn history_is_trimmed_newest_first(store: &dyn JobStore, limit: usize) {
        store.upsert(&def("a"), Some(t0()), t0()).unwrap();
        let mut recorded = Vec::new();
        for i in 0..(limit + 2) {
            let r = run("a", t0() + Duration::minutes(i as i64), RunOutcome::Success);
            store.record_run(&r, None).unwrap();
            recorded.push(r);
        }
        let runs = store.runs("a", 100).unwrap();
        assert_eq!(runs.len(), limit);
        assert_eq!(runs[0], recorded[recorded.len() - 1]);
        assert!(store.failed_runs(10).unwrap().is_empty());
    }

    pub fn reanchor_ignored_for_cron_jobs(store: &dyn JobStore) {
        let next = t0() + Duration::minutes(16);
        store.upsert(&def("a"), Some(t0()), t0()).unwrap();
        store.claim("a", t0(), Some(next)).unwrap();
        let r = run("a", t0(), RunOutcome::Success);
        let reanchor = Reanchor {
            trigger: TriggerSpec::every_secs(5),
            next: t0() + Duration::seconds(5),
        };
        store.record_run(&r, Some(&reanchor)).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().next_run_at, Some(next));
    }

    pub fn reanchor_ignored_after_trigger_replaced(store: &dyn JobStore) {
        let due = t0();
        let short = JobDefinition::new("a", "noop", TriggerSpec::every_secs(30));
        store.upsert(&short, Some(due), t0()).unwrap();
        store.claim("a", due, Some(due + Duration::seconds(30))).unwrap();

        // Replaced with a longer interval while the claimed run is going.
        let long = JobDefinition::new("a", "noop", TriggerSpec::every_secs(3600))
            .replace_existing(true);
        let replacement_next = t0() + Duration::hours(1);
        store.upsert(&long, Some(replacement_next), t0()).unwrap();

        let r = run("a", due, RunOutcome::Success);
        let stale = Reanchor {
            trigger: TriggerSpec::every_secs(30),
            next: r.ended_at + Duration::seconds(30),
        };
        store.record_run(&r, Some(&stale)).unwrap();

        let rec = store.get("a").unwrap().unwrap();
        assert_eq!(rec.in_flight, 0);
        assert_eq!(rec.next_run_at, Some(replacement_next));
    }

    pub fn reset_in_flight_clears_counters(store: &dyn JobStore) {
        store.upsert(&def("a"), Some(t0()), t0()).unwrap();
        store.claim("a", t0(), None).unwrap();
        assert_eq!(store.reset_in_flight().unwrap(), 1);
        assert_eq!(store.get("a").unwrap().unwrap().in_flight, 0);
    }

    pub fn replace_keeps_in_flight(store: &dyn JobStore) {
        store.upsert(&def("a"), Some(t0()), t0()).unwrap();
        store.claim("a", t0(), Some(t0() + Duration::hours(1))).unwrap();
        let replacement = def("a").replace_existing(true);
        store
            .upsert(&replacement, Some(t0() + Duration::minutes(5)), t0())
            .unwrap();
        let rec = store.get("a").unwrap().unwrap();
        assert_eq!(rec.in_flight, 1);
        assert_eq!(rec.next_run_at, Some(t0() + Duration::minutes(5)));
    }
}
