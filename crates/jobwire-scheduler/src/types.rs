use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allowed values for one cron field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronField {
    /// Wildcard: every value in the field's range matches.
    Any,
    /// Only the listed values match.
    Values(BTreeSet<u8>),
}

impl CronField {
    pub fn only(value: u8) -> Self {
        CronField::Values(BTreeSet::from([value]))
    }

    pub fn values<I: IntoIterator<Item = u8>>(values: I) -> Self {
        CronField::Values(values.into_iter().collect())
    }

    pub fn matches(&self, value: u8) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(set) => set.contains(&value),
        }
    }

    /// Smallest allowed value `>= from` that does not exceed `max`.
    pub fn first_from(&self, from: u8, max: u8) -> Option<u8> {
        if from > max {
            return None;
        }
        match self {
            CronField::Any => Some(from),
            CronField::Values(set) => set.range(from..=max).next().copied(),
        }
    }
}

/// Cron-like trigger. All fields must match (they are ANDed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    pub second: CronField,
    pub minute: CronField,
    pub hour: CronField,
    /// Day of month, 1-31.
    pub day: CronField,
    /// 1 = January … 12 = December.
    pub month: CronField,
    /// 0 = Monday … 6 = Sunday.
    pub day_of_week: CronField,
}

impl Default for CronSpec {
    /// Every second.
    fn default() -> Self {
        Self {
            second: CronField::Any,
            minute: CronField::Any,
            hour: CronField::Any,
            day: CronField::Any,
            month: CronField::Any,
            day_of_week: CronField::Any,
        }
    }
}

impl CronSpec {
    /// Second 0 of the given minute, every hour.
    pub fn at_minute(minute: u8) -> Self {
        Self {
            second: CronField::only(0),
            minute: CronField::only(minute),
            ..Self::default()
        }
    }

    /// HH:MM:00 every day.
    pub fn daily(hour: u8, minute: u8) -> Self {
        Self {
            second: CronField::only(0),
            minute: CronField::only(minute),
            hour: CronField::only(hour),
            ..Self::default()
        }
    }
}

/// Defines when a job becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Field-matching schedule evaluated in UTC.
    Cron(CronSpec),

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },
}

impl TriggerSpec {
    pub fn every_secs(secs: u64) -> Self {
        TriggerSpec::Interval { every_secs: secs }
    }

    pub fn is_interval(&self) -> bool {
        matches!(self, TriggerSpec::Interval { .. })
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique key in the job store.
    pub id: String,
    /// Name of the capability in the [`crate::registry::TargetRegistry`].
    pub target: String,
    /// Positional arguments handed to the target.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments handed to the target.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub trigger: TriggerSpec,
    /// Overwrite an existing job with the same id instead of failing.
    #[serde(default)]
    pub replace_existing: bool,
    /// Allow several runs of this job to be in flight at once.
    #[serde(default)]
    pub concurrency_safe: bool,
    /// Per-job run timeout; falls back to the executor default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, target: impl Into<String>, trigger: TriggerSpec) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            trigger,
            replace_existing: false,
            concurrency_safe: false,
            timeout_secs: None,
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn concurrency_safe(mut self, safe: bool) -> Self {
        self.concurrency_safe = safe;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A persisted job: its definition plus scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub definition: JobDefinition,
    /// `None` once a `Once` trigger has fired.
    pub next_run_at: Option<DateTime<Utc>>,
    /// End time of the most recently recorded run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Number of claimed runs without a recorded result.
    pub in_flight: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// Result of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "failure" => Ok(RunOutcome::Failure),
            "timeout" => Ok(RunOutcome::Timeout),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// One dispatched execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// UUID v4, primary key.
    pub id: String,
    pub job_id: String,
    /// The fire time that made the job due.
    pub scheduled_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Present iff `outcome != Success`.
    pub error_detail: Option<String>,
}
