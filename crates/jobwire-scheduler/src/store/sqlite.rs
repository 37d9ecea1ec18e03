use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use super::{ClaimOutcome, JobStore, Reanchor, UpsertOutcome};
use crate::db::{fmt_ts, init_db, parse_opt_ts, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::types::{JobDefinition, JobRecord, JobRun, TriggerSpec};

const JOB_COLUMNS: &str = "id, target, args, kwargs, trigger_spec, replace_existing,
     concurrency_safe, timeout_secs, next_run, last_run, in_flight, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, job_id, scheduled_time, started_at, ended_at, outcome, error_detail";

/// SQLite-backed store. Survives restarts; every call serialises on one
/// connection so the compare-and-swap updates are atomic.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    run_history_limit: usize,
}

impl SqliteJobStore {
    /// Open (or create) the database file, enabling WAL journaling.
    pub fn open(path: &str, run_history_limit: usize) -> Result<Self> {
        ensure_parent_dir(path)?;
        info!(path = %path, "opening SQLite job store");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, run_history_limit)
    }

    pub fn open_in_memory(run_history_limit: usize) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, run_history_limit)
    }

    pub fn from_connection(conn: Connection, run_history_limit: usize) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            run_history_limit,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("connection lock poisoned".to_string()))
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<JobRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, RunRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

impl JobStore for SqliteJobStore {
    fn upsert(
        &self,
        definition: &JobDefinition,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists = tx
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [&definition.id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists && !definition.replace_existing {
            return Err(SchedulerError::DuplicateJob {
                id: definition.id.clone(),
            });
        }

        let args = serde_json::to_string(&definition.args)?;
        let kwargs = serde_json::to_string(&definition.kwargs)?;
        let trigger = serde_json::to_string(&definition.trigger)?;
        let timeout = definition.timeout_secs.map(|s| s as i64);
        let next = next_run.map(fmt_ts);
        let now = fmt_ts(now);

        let outcome = if exists {
            tx.execute(
                "UPDATE jobs SET target=?2, args=?3, kwargs=?4, trigger_spec=?5,
                   replace_existing=?6, concurrency_safe=?7, timeout_secs=?8,
                   next_run=?9, updated_at=?10
                 WHERE id=?1",
                rusqlite::params![
                    definition.id,
                    definition.target,
                    args,
                    kwargs,
                    trigger,
                    definition.replace_existing,
                    definition.concurrency_safe,
                    timeout,
                    next,
                    now
                ],
            )?;
            UpsertOutcome::Replaced
        } else {
            tx.execute(
                "INSERT INTO jobs
                 (id, target, args, kwargs, trigger_spec, replace_existing, concurrency_safe,
                  timeout_secs, next_run, last_run, in_flight, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,0,?10,?10)",
                rusqlite::params![
                    definition.id,
                    definition.target,
                    args,
                    kwargs,
                    trigger,
                    definition.replace_existing,
                    definition.concurrency_safe,
                    timeout,
                    next,
                    now
                ],
            )?;
            UpsertOutcome::Inserted
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn remove(&self, job_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [job_id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        Ok(self.query_jobs(&sql, [job_id])?.into_iter().next())
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id");
        self.query_jobs(&sql, [])
    }

    fn get_due(&self, as_of: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE next_run IS NOT NULL AND next_run <= ?1
             ORDER BY id"
        );
        self.query_jobs(&sql, [fmt_ts(as_of)])
    }

    fn claim(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<ClaimOutcome> {
        let conn = self.conn()?;
        let expected = fmt_ts(expected_next);
        let next = new_next.map(fmt_ts);
        let now = fmt_ts(Utc::now());

        let claimed = conn.execute(
            "UPDATE jobs SET next_run=?1, in_flight=in_flight+1, updated_at=?2
             WHERE id=?3 AND next_run=?4 AND (in_flight=0 OR concurrency_safe=1)",
            rusqlite::params![next, now, job_id, expected],
        )?;
        if claimed == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let skipped = conn.execute(
            "UPDATE jobs SET next_run=?1, updated_at=?2 WHERE id=?3 AND next_run=?4",
            rusqlite::params![next, now, job_id, expected],
        )?;
        Ok(if skipped == 1 {
            ClaimOutcome::Busy
        } else {
            ClaimOutcome::Stale
        })
    }

    fn reschedule(
        &self,
        job_id: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET next_run=?1, updated_at=?2 WHERE id=?3 AND next_run=?4",
            rusqlite::params![
                new_next.map(fmt_ts),
                fmt_ts(Utc::now()),
                job_id,
                fmt_ts(expected_next)
            ],
        )?;
        Ok(n == 1)
    }

    fn record_run(&self, run: &JobRun, reanchor: Option<&Reanchor>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ended = fmt_ts(run.ended_at);

        tx.execute(
            "INSERT INTO job_runs
             (id, job_id, scheduled_time, started_at, ended_at, outcome, error_detail)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                run.id,
                run.job_id,
                fmt_ts(run.scheduled_time),
                fmt_ts(run.started_at),
                ended,
                run.outcome.to_string(),
                run.error_detail
            ],
        )?;

        // Only re-anchor while the stored trigger is the one the run was
        // claimed with; a replacement registered mid-run keeps its schedule.
        let (next, claimed_trigger) = match reanchor {
            Some(r) => (Some(fmt_ts(r.next)), Some(serde_json::to_string(&r.trigger)?)),
            None => (None, None),
        };
        tx.execute(
            "UPDATE jobs SET
               in_flight = MAX(in_flight - 1, 0),
               last_run = ?2,
               updated_at = ?2,
               next_run = CASE
                 WHEN ?3 IS NOT NULL AND trigger_spec = ?4
                 THEN ?3 ELSE next_run END
             WHERE id = ?1",
            rusqlite::params![run.job_id, ended, next, claimed_trigger],
        )?;

        tx.execute(
            "DELETE FROM job_runs WHERE job_id = ?1 AND id NOT IN (
               SELECT id FROM job_runs WHERE job_id = ?1
               ORDER BY started_at DESC LIMIT ?2)",
            rusqlite::params![run.job_id, self.run_history_limit as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1
             ORDER BY started_at DESC LIMIT ?2"
        );
        self.query_runs(&sql, rusqlite::params![job_id, limit as i64])
    }

    fn failed_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE outcome != 'success'
             ORDER BY started_at DESC LIMIT ?1"
        );
        self.query_runs(&sql, [limit as i64])
    }

    fn reset_in_flight(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET in_flight = 0, updated_at = ?1 WHERE in_flight > 0",
            [fmt_ts(Utc::now())],
        )?;
        Ok(n)
    }
}

/// Raw column values; decoded outside the rusqlite row closure so JSON and
/// timestamp errors surface as scheduler errors.
struct JobRow {
    id: String,
    target: String,
    args: String,
    kwargs: String,
    trigger: String,
    replace_existing: bool,
    concurrency_safe: bool,
    timeout_secs: Option<i64>,
    next_run: Option<String>,
    last_run: Option<String>,
    in_flight: i64,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            args: row.get(2)?,
            kwargs: row.get(3)?,
            trigger: row.get(4)?,
            replace_existing: row.get(5)?,
            concurrency_safe: row.get(6)?,
            timeout_secs: row.get(7)?,
            next_run: row.get(8)?,
            last_run: row.get(9)?,
            in_flight: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let trigger: TriggerSpec = serde_json::from_str(&self.trigger)?;
        Ok(JobRecord {
            definition: JobDefinition {
                id: self.id,
                target: self.target,
                args: serde_json::from_str(&self.args)?,
                kwargs: serde_json::from_str(&self.kwargs)?,
                trigger,
                replace_existing: self.replace_existing,
                concurrency_safe: self.concurrency_safe,
                timeout_secs: self.timeout_secs.map(|s| s.max(0) as u64),
            },
            next_run_at: parse_opt_ts(self.next_run)?,
            last_run_at: parse_opt_ts(self.last_run)?,
            in_flight: self.in_flight.clamp(0, u32::MAX as i64) as u32,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RunRow {
    id: String,
    job_id: String,
    scheduled_time: String,
    started_at: String,
    ended_at: String,
    outcome: String,
    error_detail: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            scheduled_time: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            outcome: row.get(5)?,
            error_detail: row.get(6)?,
        })
    }

    fn into_run(self) -> Result<JobRun> {
        Ok(JobRun {
            id: self.id,
            job_id: self.job_id,
            scheduled_time: parse_ts(&self.scheduled_time)?,
            started_at: parse_ts(&self.started_at)?,
            ended_at: parse_ts(&self.ended_at)?,
            outcome: self
                .outcome
                .parse()
                .map_err(SchedulerError::StoreUnavailable)?,
            error_detail: self.error_detail,
        })
    }
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::StoreUnavailable(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}
