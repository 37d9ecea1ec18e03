use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this id exists and the new definition did not ask to replace it.
    #[error("Duplicate job: {id}")]
    DuplicateJob { id: String },

    /// The trigger can never fire (out-of-range fields, impossible dates, ...).
    #[error("Unsatisfiable trigger: {0}")]
    UnsatisfiableTrigger(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The definition names a capability the registry does not know.
    #[error("Unknown target: {name}")]
    UnknownTarget { name: String },

    /// A `{method, args, kwargs}` entry could not be turned into a definition.
    #[error("Invalid job entry: {0}")]
    InvalidJobEntry(String),

    /// The job store backend cannot be reached right now.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// True for failures of the persistence layer, which the dispatcher
    /// treats as transient and retries on a later tick.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::StoreUnavailable(_) | SchedulerError::Database(_)
        )
    }
}

impl From<jobwire_core::CoreError> for SchedulerError {
    fn from(e: jobwire_core::CoreError) -> Self {
        SchedulerError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure of a single job run. Rendered into `JobRun::error_detail`; never
/// propagated to the dispatcher.
#[derive(Debug, Error)]
pub enum JobExecutionError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job exceeded its timeout of {secs}s")]
    TimedOut { secs: u64 },

    #[error("no target registered under {name:?}")]
    UnknownTarget { name: String },
}
