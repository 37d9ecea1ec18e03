//! Turning the configured `jobs` / `custom` lists into registrations.
//!
//! A static entry names its target in `method`, the trigger kind in
//! `args[0]` (`"cron"`, `"interval"` or `"date"`), and everything else in
//! `kwargs`:
//!
//! ```toml
//! [[scheduler.jobs]]
//! method = "reports.refresh"
//! args = ["cron"]
//! kwargs = { id = "refresh", minute = 16, replace_existing = true }
//! ```

use chrono::{DateTime, Utc};
use jobwire_core::JobEntry;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::registrar::Registrar;
use crate::trigger::{cron_from_fields, CRON_FIELD_NAMES};
use crate::types::{JobDefinition, TriggerSpec};

/// Keys understood for every trigger kind.
const COMMON_KEYS: [&str; 6] = [
    "id",
    "replace_existing",
    "concurrency_safe",
    "timeout_secs",
    "args",
    "kwargs",
];

/// (name, seconds per unit) for interval entries.
const INTERVAL_UNITS: [(&str, u64); 5] = [
    ("weeks", 7 * 86_400),
    ("days", 86_400),
    ("hours", 3_600),
    ("minutes", 60),
    ("seconds", 1),
];

/// Build a definition from one static entry. Without an explicit `id` the
/// method name is used, so restarts find the same job.
pub fn definition_from_entry(entry: &JobEntry) -> Result<JobDefinition> {
    let invalid = |why: String| SchedulerError::InvalidJobEntry(format!("{}: {why}", entry.method));

    if entry.method.trim().is_empty() {
        return Err(SchedulerError::InvalidJobEntry(
            "entry has an empty method".to_string(),
        ));
    }

    let kind = entry
        .args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("args[0] must name the trigger kind".to_string()))?;

    let kwargs = &entry.kwargs;
    let trigger = match kind {
        "cron" => {
            ensure_known_keys(kwargs, &CRON_FIELD_NAMES).map_err(invalid)?;
            let fields: Map<String, Value> = kwargs
                .iter()
                .filter(|(k, _)| CRON_FIELD_NAMES.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if fields.is_empty() {
                return Err(invalid("cron entry sets no fields".to_string()));
            }
            TriggerSpec::Cron(cron_from_fields(&fields)?)
        }
        "interval" => {
            let units: Vec<&str> = INTERVAL_UNITS.iter().map(|(name, _)| *name).collect();
            ensure_known_keys(kwargs, &units).map_err(invalid)?;
            let mut total: u64 = 0;
            for (unit, secs) in INTERVAL_UNITS {
                if let Some(v) = kwargs.get(unit) {
                    let n = v
                        .as_u64()
                        .ok_or_else(|| invalid(format!("{unit} must be a non-negative integer")))?;
                    total = n
                        .checked_mul(secs)
                        .and_then(|s| total.checked_add(s))
                        .ok_or_else(|| invalid("interval overflows".to_string()))?;
                }
            }
            TriggerSpec::Interval { every_secs: total }
        }
        "date" => {
            ensure_known_keys(kwargs, &["run_date"]).map_err(invalid)?;
            let raw = kwargs
                .get("run_date")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("date entry needs a run_date string".to_string()))?;
            let at = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| invalid(format!("run_date {raw:?}: {e}")))?
                .with_timezone(&Utc);
            TriggerSpec::Once { at }
        }
        other => return Err(invalid(format!("unknown trigger kind {other:?}"))),
    };

    let id = match kwargs.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => return Err(invalid(format!("id must be a string, got {other}"))),
        None => entry.method.clone(),
    };

    let mut definition = JobDefinition::new(id, entry.method.clone(), trigger)
        .replace_existing(flag(kwargs, "replace_existing").map_err(invalid)?)
        .concurrency_safe(flag(kwargs, "concurrency_safe").map_err(invalid)?);

    if let Some(v) = kwargs.get("timeout_secs") {
        let secs = v
            .as_u64()
            .ok_or_else(|| invalid("timeout_secs must be a non-negative integer".to_string()))?;
        definition = definition.timeout_secs(secs);
    }

    // Positional args for the target: `args[1]`, or the `args` kwarg.
    let job_args = match (entry.args.get(1), kwargs.get("args")) {
        (Some(_), Some(_)) => return Err(invalid("job args given twice".to_string())),
        (Some(v), None) | (None, Some(v)) => v
            .as_array()
            .cloned()
            .ok_or_else(|| invalid("job args must be an array".to_string()))?,
        (None, None) => Vec::new(),
    };
    let job_kwargs = match (entry.args.get(2), kwargs.get("kwargs")) {
        (Some(_), Some(_)) => return Err(invalid("job kwargs given twice".to_string())),
        (Some(v), None) | (None, Some(v)) => v
            .as_object()
            .cloned()
            .ok_or_else(|| invalid("job kwargs must be an object".to_string()))?,
        (None, None) => Map::new(),
    };
    if entry.args.len() > 3 {
        return Err(invalid(format!(
            "expected at most 3 positional args, got {}",
            entry.args.len()
        )));
    }

    Ok(definition.with_args(job_args).with_kwargs(job_kwargs))
}

/// Register every static entry in one all-or-nothing batch.
pub fn load_static_jobs(registrar: &Registrar, entries: &[JobEntry]) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }
    let definitions = entries
        .iter()
        .map(definition_from_entry)
        .collect::<Result<Vec<_>>>()?;
    let registered = registrar.register_bulk(definitions)?;
    info!(count = registered.len(), "static jobs registered");
    Ok(registered.len())
}

/// Invoke each custom setup callable in list order. Stops at the first
/// failure.
pub fn run_custom_jobs(registrar: &Registrar, entries: &[JobEntry]) -> Result<usize> {
    for entry in entries {
        registrar.register_custom_named(&entry.method, &entry.args, &entry.kwargs)?;
    }
    if !entries.is_empty() {
        info!(count = entries.len(), "custom job setups ran");
    }
    Ok(entries.len())
}

fn ensure_known_keys(kwargs: &Map<String, Value>, trigger_keys: &[&str]) -> std::result::Result<(), String> {
    match kwargs
        .keys()
        .find(|k| !COMMON_KEYS.contains(&k.as_str()) && !trigger_keys.contains(&k.as_str()))
    {
        Some(unknown) => Err(format!("unexpected key {unknown:?}")),
        None => Ok(()),
    }
}

fn flag(kwargs: &Map<String, Value>, key: &str) -> std::result::Result<bool, String> {
    match kwargs.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(format!("{key} must be a boolean, got {other}")),
    }
}
