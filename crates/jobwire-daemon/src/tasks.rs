use chrono::Utc;
use jobwire_scheduler::{
    fn_target, JobContext, JobDefinition, Registrar, SchedulerError, TargetRegistry, TriggerSpec,
};
use serde_json::{Map, Value};
use tracing::info;

pub const HEARTBEAT: &str = "builtin.heartbeat";
pub const SAMPLE_SETUP: &str = "builtin.sample_setup";

const SAMPLE_DEFAULT_EVERY_SECS: u64 = 60;

/// Targets and setup callables shipped with the daemon.
pub fn builtin_registry() -> TargetRegistry {
    TargetRegistry::new()
        .with_target(HEARTBEAT, fn_target(heartbeat))
        .with_setup(SAMPLE_SETUP, sample_setup)
}

async fn heartbeat(ctx: JobContext) -> anyhow::Result<()> {
    let lag_ms = (Utc::now() - ctx.scheduled_time).num_milliseconds();
    info!(
        job_id = %ctx.job_id,
        run_id = %ctx.run_id,
        lag_ms,
        args = %serde_json::Value::Array(ctx.args.clone()),
        "heartbeat"
    );
    Ok(())
}

/// Registers `sample.<label>` running the heartbeat on an interval. The label
/// is the first positional arg; `every_secs` sets the interval and every
/// other kwarg is bound to the job.
fn sample_setup(registrar: &Registrar, args: &[Value], kwargs: &Map<String, Value>) -> jobwire_scheduler::Result<()> {
    let label = match args.first() {
        None => "default",
        Some(Value::String(s)) if !s.is_empty() => s.as_str(),
        Some(other) => {
            return Err(SchedulerError::InvalidJobEntry(format!(
                "{SAMPLE_SETUP}: label must be a non-empty string, got {other}"
            )))
        }
    };
    let every = match kwargs.get("every_secs") {
        None => SAMPLE_DEFAULT_EVERY_SECS,
        Some(v) => v.as_u64().ok_or_else(|| {
            SchedulerError::InvalidJobEntry(format!("{SAMPLE_SETUP}: every_secs must be an integer"))
        })?,
    };
    let bound: Map<String, Value> = kwargs
        .iter()
        .filter(|(k, _)| k.as_str() != "every_secs")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let definition = JobDefinition::new(format!("sample.{label}"), HEARTBEAT, TriggerSpec::every_secs(every))
        .with_args(args.to_vec())
        .with_kwargs(bound)
        .replace_existing(true);
    registrar.register(definition)?;
    Ok(())
}
