use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::registry::TargetRegistry;
use crate::store::{JobStore, UpsertOutcome};
use crate::trigger::{next_fire_time, validate};
use crate::types::{JobDefinition, JobRecord};

/// Handle for adding and removing jobs while the scheduler runs.
///
/// Cheap to clone; every clone writes through the same store, so a job
/// registered here is picked up by the dispatcher on its next tick.
#[derive(Clone)]
pub struct Registrar {
    store: Arc<dyn JobStore>,
    registry: Arc<TargetRegistry>,
}

impl Registrar {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<TargetRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Validate and persist one job, computing its first fire time from now.
    pub fn register(&self, definition: JobDefinition) -> Result<JobRecord> {
        self.register_at(definition, Utc::now())
    }

    /// [`register`](Self::register) with an explicit clock, so the first fire
    /// time is computed from `now`.
    pub fn register_at(&self, definition: JobDefinition, now: DateTime<Utc>) -> Result<JobRecord> {
        let next = self.check(&definition, now)?;
        self.persist(&definition, next, now)
    }

    /// Register a batch. Every definition is checked before anything is
    /// written, so one bad entry leaves the store untouched.
    pub fn register_bulk(&self, definitions: Vec<JobDefinition>) -> Result<Vec<JobRecord>> {
        let now = Utc::now();
        let mut checked = Vec::with_capacity(definitions.len());
        for (idx, definition) in definitions.iter().enumerate() {
            let clashes = definitions[..idx].iter().any(|d| d.id == definition.id)
                || (!definition.replace_existing && self.store.get(&definition.id)?.is_some());
            if clashes {
                return Err(SchedulerError::DuplicateJob {
                    id: definition.id.clone(),
                });
            }
            checked.push(self.check(definition, now)?);
        }

        definitions
            .iter()
            .zip(checked)
            .map(|(definition, next)| self.persist(definition, next, now))
            .collect()
    }

    /// Hand the registrar to a setup closure that registers its own jobs.
    pub fn register_custom<F>(&self, setup: F) -> Result<()>
    where
        F: FnOnce(&Registrar) -> Result<()>,
    {
        setup(self)
    }

    /// Invoke the setup callable registered under `name`.
    pub fn register_custom_named(
        &self,
        name: &str,
        args: &[serde_json::Value],
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let setup = self
            .registry
            .setup(name)
            .ok_or_else(|| SchedulerError::UnknownTarget {
                name: name.to_string(),
            })?;
        debug!(setup = %name, "running custom job setup");
        setup(self, args, kwargs)
    }

    /// Remove a job. Runs already in flight finish and are still recorded.
    pub fn unregister(&self, job_id: &str) -> Result<()> {
        self.store.remove(job_id)?;
        info!(job_id = %job_id, "job unregistered");
        Ok(())
    }

    fn check(&self, definition: &JobDefinition, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if definition.id.trim().is_empty() {
            return Err(SchedulerError::InvalidJobEntry(
                "job id must not be empty".to_string(),
            ));
        }
        if !self.registry.has_target(&definition.target) {
            return Err(SchedulerError::UnknownTarget {
                name: definition.target.clone(),
            });
        }
        if definition.timeout_secs == Some(0) {
            return Err(SchedulerError::InvalidJobEntry(format!(
                "job {}: timeout_secs must be positive",
                definition.id
            )));
        }
        validate(&definition.trigger, now)?;
        Ok(next_fire_time(&definition.trigger, now))
    }

    fn persist(
        &self,
        definition: &JobDefinition,
        next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let outcome = self.store.upsert(definition, next, now)?;
        match outcome {
            UpsertOutcome::Inserted => {
                info!(job_id = %definition.id, target = %definition.target, next_run = ?next, "job registered")
            }
            UpsertOutcome::Replaced => {
                info!(job_id = %definition.id, target = %definition.target, next_run = ?next, "job replaced")
            }
        }
        self.store
            .get(&definition.id)?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: definition.id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fn_target;
    use crate::store::MemoryJobStore;
    use crate::types::{CronSpec, TriggerSpec};
    use chrono::TimeZone;

    fn registrar() -> Registrar {
        let registry = TargetRegistry::new()
            .with_target("noop", fn_target(|_| async { Ok(()) }))
            .with_setup("two_jobs", |r, _, kwargs| {
                let every = kwargs
                    .get("every")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(60);
                r.register(JobDefinition::new("s1", "noop", TriggerSpec::every_secs(every)))?;
                r.register(JobDefinition::new("s2", "noop", TriggerSpec::every_secs(every)))?;
                Ok(())
            });
        Registrar::new(Arc::new(MemoryJobStore::new(10)), Arc::new(registry))
    }

    fn hourly(id: &str) -> JobDefinition {
        JobDefinition::new(id, "noop", TriggerSpec::Cron(CronSpec::at_minute(16)))
    }

    #[test]
    fn first_fire_time_is_computed_at_registration() {
        let r = registrar();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let rec = r.register_at(hourly("a"), now).unwrap();
        assert_eq!(
            rec.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 16, 0).unwrap())
        );
        assert_eq!(rec.in_flight, 0);
    }

    #[test]
    fn rejects_unknown_target_and_bad_trigger() {
        let r = registrar();
        let err = r
            .register(JobDefinition::new("a", "missing", TriggerSpec::every_secs(5)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTarget { .. }));

        let err = r
            .register(JobDefinition::new("a", "noop", TriggerSpec::every_secs(0)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnsatisfiableTrigger(_)));
        assert!(r.store.list().unwrap().is_empty());
    }

    #[test]
    fn bulk_is_all_or_nothing() {
        let r = registrar();
        let batch = vec![
            hourly("a"),
            JobDefinition::new("b", "missing", TriggerSpec::every_secs(5)),
        ];
        assert!(r.register_bulk(batch).is_err());
        assert!(r.store.list().unwrap().is_empty());

        let dup = vec![hourly("a"), hourly("a")];
        assert!(matches!(
            r.register_bulk(dup).unwrap_err(),
            SchedulerError::DuplicateJob { .. }
        ));

        let ok = r.register_bulk(vec![hourly("a"), hourly("b")]).unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn named_setup_registers_its_jobs() {
        let r = registrar();
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("every".into(), serde_json::json!(30));
        r.register_custom_named("two_jobs", &[], &kwargs).unwrap();
        let ids: Vec<String> = r
            .store
            .list()
            .unwrap()
            .into_iter()
            .map(|j| j.definition.id)
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        assert!(matches!(
            r.register_custom_named("nope", &[], &kwargs).unwrap_err(),
            SchedulerError::UnknownTarget { .. }
        ));
    }

    #[test]
    fn closure_setup_and_unregister() {
        let r = registrar();
        r.register_custom(|reg| reg.register(hourly("c")).map(|_| ()))
            .unwrap();
        r.unregister("c").unwrap();
        assert!(matches!(
            r.unregister("c").unwrap_err(),
            SchedulerError::JobNotFound { .. }
        ));
    }
}
