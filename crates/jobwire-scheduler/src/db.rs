use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `job_runs` tables (idempotent) and an index on
/// `next_run` so the due-job query stays cheap with many jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            target           TEXT    NOT NULL,
            args             TEXT    NOT NULL,   -- JSON array
            kwargs           TEXT    NOT NULL,   -- JSON object
            trigger_spec     TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            replace_existing INTEGER NOT NULL DEFAULT 0,
            concurrency_safe INTEGER NOT NULL DEFAULT 0,
            timeout_secs     INTEGER,
            next_run         TEXT,               -- fixed-width RFC 3339 or NULL
            last_run         TEXT,
            in_flight        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run);

        CREATE TABLE IF NOT EXISTS job_runs (
            id             TEXT NOT NULL PRIMARY KEY,
            job_id         TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            started_at     TEXT NOT NULL,
            ended_at       TEXT NOT NULL,
            outcome        TEXT NOT NULL,
            error_detail   TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs (job_id, started_at);
        ",
    )?;
    Ok(())
}

/// Millisecond precision with a `Z` suffix: every value has the same width,
/// so `<=` on the TEXT column orders chronologically.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::StoreUnavailable(format!("corrupt timestamp {raw:?}: {e}")))
}

pub fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(fmt_ts(b), "2024-01-01T10:00:00.000Z");
        assert_eq!(parse_ts(&fmt_ts(b)).unwrap(), b);
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
