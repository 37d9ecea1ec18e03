//! Shared configuration and error types for the jobwire workspace.

pub mod config;
pub mod error;

pub use config::{
    ExecutorConfig, ExecutorKind, JobEntry, JobStoreBackend, JobStoreConfig, JobwireConfig,
    LoggingConfig, SchedulerConfig,
};
pub use error::{CoreError, Result};
