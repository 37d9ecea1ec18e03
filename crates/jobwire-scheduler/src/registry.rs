use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registrar::Registrar;

/// Everything a job body gets for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub run_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Cancelled on timeout and when shutdown outlasts its grace period.
    /// Checking it is up to the body.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&serde_json::Value> {
        self.kwargs.get(key)
    }
}

/// Executable job logic, looked up by name when a job fires.
///
/// Returning `Err` or panicking marks the run as failed; neither reaches the
/// dispatcher.
#[async_trait]
pub trait JobTarget: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`JobTarget`].
pub struct FnTarget<F>(F);

#[async_trait]
impl<F, Fut> JobTarget for FnTarget<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

pub fn fn_target<F, Fut>(f: F) -> Arc<dyn JobTarget>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnTarget(f))
}

/// Setup callable for the custom job list: receives the registrar plus the
/// entry's args and kwargs, and may register whatever it likes.
pub type SetupFn = Arc<
    dyn Fn(&Registrar, &[serde_json::Value], &serde_json::Map<String, serde_json::Value>) -> Result<()>
        + Send
        + Sync,
>;

/// Explicit name → capability map. Job definitions refer to targets by name
/// only, so nothing is resolved from strings at runtime beyond this lookup.
#[derive(Default, Clone)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<dyn JobTarget>>,
    setups: HashMap<String, SetupFn>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: impl Into<String>, target: Arc<dyn JobTarget>) -> Self {
        self.add_target(name, target);
        self
    }

    /// Later registrations under the same name win.
    pub fn add_target(&mut self, name: impl Into<String>, target: Arc<dyn JobTarget>) {
        self.targets.insert(name.into(), target);
    }

    pub fn with_setup<F>(mut self, name: impl Into<String>, setup: F) -> Self
    where
        F: Fn(&Registrar, &[serde_json::Value], &serde_json::Map<String, serde_json::Value>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.setups.insert(name.into(), Arc::new(setup));
        self
    }

    pub fn target(&self, name: &str) -> Option<Arc<dyn JobTarget>> {
        self.targets.get(name).cloned()
    }

    pub fn setup(&self, name: &str) -> Option<SetupFn> {
        self.setups.get(name).cloned()
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Sorted, for diagnostics.
    pub fn target_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
