//! `jobwire-scheduler`: persistent job scheduler on tokio.
//!
//! # Overview
//!
//! Job definitions live in a [`store::JobStore`] (SQLite or in-memory). The
//! [`dispatcher::Dispatcher`] wakes on every tick, claims each due job by
//! compare-and-swap on its next fire time, and hands it to the
//! [`worker::WorkerPool`], which runs the body with panic capture and an
//! optional timeout and records a [`types::JobRun`].
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                                 |
//! |------------|-----------------------------------------------------------|
//! | `Cron`     | Every UTC second matching all six fields (ANDed)          |
//! | `Interval` | Every N seconds, re-anchored to the end of the last run   |
//! | `Once`     | Single fire at an absolute UTC instant                    |
//!
//! Missed fire times (process down, dispatcher stopped) are skipped on start,
//! never backfilled.

pub mod bootstrap;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod registrar;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod trigger;
pub mod types;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherState, TickReport};
pub use error::{JobExecutionError, Result, SchedulerError};
pub use registrar::Registrar;
pub use registry::{fn_target, JobContext, JobTarget, SetupFn, TargetRegistry};
pub use scheduler::Scheduler;
pub use store::{ClaimOutcome, JobStore, MemoryJobStore, Reanchor, SqliteJobStore, UpsertOutcome};
pub use types::{CronField, CronSpec, JobDefinition, JobRecord, JobRun, RunOutcome, TriggerSpec};
pub use worker::WorkerPool;
