use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_RUN_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_LOG_FILTER: &str = "jobwire=info";

/// Legacy variable name honoured for the autostart flag.
pub const AUTOSTART_ENV: &str = "SCHEDULER_AUTOSTART";

/// Top-level config (jobwire.toml + JOBWIRE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobwireConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Begin ticking as soon as the scheduler is bootstrapped.
    /// Override with env var: SCHEDULER_AUTOSTART=1
    #[serde(default, deserialize_with = "flexible_bool")]
    pub autostart: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long `stop()` waits for in-flight runs.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Upper bound for the tick backoff while the job store is unreachable.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Runs kept per job in the history table.
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
    #[serde(default)]
    pub jobstore: JobStoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Pre-bound jobs, registered in bulk at bootstrap.
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
    /// Setup callables invoked with the registrar at bootstrap.
    #[serde(default)]
    pub custom: Vec<JobEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            run_history_limit: DEFAULT_RUN_HISTORY_LIMIT,
            jobstore: JobStoreConfig::default(),
            executor: ExecutorConfig::default(),
            jobs: Vec::new(),
            custom: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    #[serde(default)]
    pub backend: JobStoreBackend,
    /// SQLite file path; a leading `~/` expands to `$HOME`.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            backend: JobStoreBackend::default(),
            path: default_db_path(),
        }
    }
}

impl JobStoreConfig {
    pub fn resolved_path(&self) -> String {
        expand_home(&self.path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Job bodies run as tasks on the shared tokio runtime.
    #[default]
    Threadpool,
    /// Accepted by the parser so old configs load, rejected by `validate`.
    Processpool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Applied to jobs that do not set their own `timeout_secs`.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            default_timeout_secs: None,
        }
    }
}

/// One `{method, args, kwargs}` triple from the `jobs` or `custom` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEntry {
    /// Name of a capability in the target registry.
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}
fn default_run_history_limit() -> usize {
    DEFAULT_RUN_HISTORY_LIMIT
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_db_path() -> String {
    "~/.jobwire/jobwire.db".to_string()
}

fn default_config_path() -> String {
    expand_home("~/.jobwire/jobwire.toml")
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{}/{}", home, rest)
        }
        None => path.to_string(),
    }
}

/// Accepts `true`, `1`, `"yes"`, `"on"` and friends. Anything else is false.
fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Flexible::deserialize(deserializer)? {
        Flexible::Bool(b) => b,
        Flexible::Int(n) => n != 0,
        Flexible::Str(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
    })
}

impl JobwireConfig {
    /// Load config from a TOML file with env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobwire/jobwire.toml
    ///
    /// `JOBWIRE_SCHEDULER__TICK_INTERVAL_MS=500` style variables override file
    /// values, and `SCHEDULER_AUTOSTART` maps onto `scheduler.autostart`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // An explicit path must exist; the default one is optional.
        if let Some(explicit) = config_path {
            std::fs::metadata(explicit)?;
        }
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobwireConfig = Self::figment(&path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, jobs = config.scheduler.jobs.len(), "configuration loaded");
        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("JOBWIRE_").ignore(&["CONFIG"]).split("__"))
            .merge(
                Env::raw()
                    .only(&[AUTOSTART_ENV])
                    .map(|_| "scheduler.autostart".into()),
            )
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_interval_ms == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if s.run_history_limit == 0 {
            return Err(CoreError::Config(
                "scheduler.run_history_limit must be greater than zero".to_string(),
            ));
        }
        if s.executor.max_workers == 0 {
            return Err(CoreError::Config(
                "scheduler.executor.max_workers must be greater than zero".to_string(),
            ));
        }
        if s.executor.kind == ExecutorKind::Processpool {
            return Err(CoreError::Config(
                "scheduler.executor.kind = \"processpool\" is not supported: job targets are \
                 in-process capabilities, use \"threadpool\""
                    .to_string(),
            ));
        }
        if s.executor.default_timeout_secs == Some(0) {
            return Err(CoreError::Config(
                "scheduler.executor.default_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
