use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{ClaimOutcome, JobStore, Reanchor, UpsertOutcome};
use crate::error::{Result, SchedulerError};
use crate::types::{JobDefinition, JobRecord, JobRun, RunOutcome};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, JobRecord>,
    /// Oldest first per job.
    runs: HashMap<String, VecDeque<JobRun>>,
}

/// Volatile store for tests and deployments that re-register every job at
/// startup. Nothing survives the process.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    run_history_limit: usize,
}

impl MemoryJobStore {
    pub fn new(run_history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            run_history_limit,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl JobStore for MemoryJobStore {
    fn upsert(
        &self,
        definition: &JobDefinition,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        match inner.jobs.get_mut(&definition.id) {
            Some(_) if !definition.replace_existing => Err(SchedulerError::DuplicateJob {
                id: definition.id.clone(),
            }),
            Some(existing) => {
                existing.definition = definition.clone();
                existing.next_run_at = next_run;
                existing.updated_at = now;
                Ok(UpsertOutcome::Replaced)
            }
            None => {
                inner.jobs.insert(
                    definition.id.clone(),
                    JobRecord {
                        definition: definition.clone(),
                        next_run_at: next_run,
                        last_run_at: None,
                        in_flight: 0,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn remove(&self, job_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .jobs
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    fn get_due(&self, as_of: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|r| r.next_run_at.is_some_and(|next| next <= as_of))
            .cloned()
            .collect())
    }

    fn claim(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<ClaimOutcome> {
        let mut inner = self.lock()?;
        let Some(rec) = inner.jobs.get_mut(job_id) else {
            return Ok(ClaimOutcome::Stale);
        };
        if rec.next_run_at != Some(expected_next) {
            return Ok(ClaimOutcome::Stale);
        }
        rec.next_run_at = new_next;
        rec.updated_at = Utc::now();
        if rec.in_flight == 0 || rec.definition.concurrency_safe {
            rec.in_flight += 1;
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Busy)
        }
    }

    fn reschedule(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(job_id) {
            Some(rec) if rec.next_run_at == Some(expected_next) => {
                rec.next_run_at = new_next;
                rec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_run(&self, run: &JobRun, reanchor: Option<&Reanchor>) -> Result<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if let Some(rec) = inner.jobs.get_mut(&run.job_id) {
            rec.in_flight = rec.in_flight.saturating_sub(1);
            rec.last_run_at = Some(run.ended_at);
            rec.updated_at = run.ended_at;
            if let Some(r) = reanchor.filter(|r| r.trigger == rec.definition.trigger) {
                rec.next_run_at = Some(r.next);
            }
        }

        let history = inner.runs.entry(run.job_id.clone()).or_default();
        history.push_back(run.clone());
        while history.len() > self.run_history_limit {
            history.pop_front();
        }
        Ok(())
    }

    fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let inner = self.lock()?;
        let mut runs: Vec<JobRun> = inner
            .runs
            .get(job_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn failed_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        let inner = self.lock()?;
        let mut runs: Vec<JobRun> = inner
            .runs
            .values()
            .flatten()
            .filter(|r| r.outcome != RunOutcome::Success)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn reset_in_flight(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut touched = 0;
        for rec in inner.jobs.values_mut().filter(|r| r.in_flight > 0) {
            rec.in_flight = 0;
            touched += 1;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> MemoryJobStore {
        MemoryJobStore::new(3)
    }

    #[test]
    fn duplicate_and_replace() {
        contract::duplicate_and_replace(&store());
    }

    #[test]
    fn due_order_and_remove() {
        contract::due_order_and_remove(&store());
    }

    #[test]
    fn claim_is_compare_and_swap() {
        contract::claim_is_compare_and_swap(&store());
    }

    #[test]
    fn concurrency_safe_jobs_stack() {
        contract::concurrency_safe_jobs_stack(&store());
    }

    #[test]
    fn record_run_releases_and_reanchors() {
        contract::record_run_releases_and_reanchors(&store());
    }

    #[test]
    fn history_is_trimmed_newest_first() {
        contract::history_is_trimmed_newest_first(&store(), 3);
    }

    #[test]
    fn reanchor_ignored_for_cron_jobs() {
        contract::reanchor_ignored_for_cron_jobs(&store());
    }

    #[test]
    fn reanchor_ignored_after_trigger_replaced() {
        contract::reanchor_ignored_after_trigger_replaced(&store());
    }

    #[test]
    fn reset_in_flight_clears_counters() {
        contract::reset_in_flight_clears_counters(&store());
    }

    #[test]
    fn replace_keeps_in_flight() {
        contract::replace_keeps_in_flight(&store());
    }
}
