//! Job functions exposed to the scheduler

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use trubble_common::redact;
use trubble_core::{AuditReport, Error, Result, SnapshotSource};
use trubble_nova::{AuditEngine, AuditRequest};
use trubble_scheduler::{FunctionRegistry, JobFunction, ScheduleJob};

/// Which nova entry point a job calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NovaEntry {
    /// `nova.audit`: explicit profiles, first arg is a comma-separated path list
    Audit,
    /// `nova.top`: everything the topfile selects, first arg overrides the topfile
    Top,
}

/// Runs the audit engine for a scheduled job
///
/// Host attributes are captured fresh for every firing.
pub struct NovaFunction {
    entry: NovaEntry,
    engine: Arc<AuditEngine>,
    snapshots: Arc<dyn SnapshotSource>,
}

impl NovaFunction {
    pub fn new(entry: NovaEntry, engine: Arc<AuditEngine>, snapshots: Arc<dyn SnapshotSource>) -> Self {
        Self {
            entry,
            engine,
            snapshots,
        }
    }

    /// Request described by the job's args and kwargs
    pub fn request(&self, job: &ScheduleJob) -> AuditRequest {
        let verbose = job.kwarg_bool("verbose").unwrap_or(false);
        let request = match self.entry {
            NovaEntry::Audit => {
                let paths = job
                    .arg_str(0)
                    .or_else(|| job.kwarg_str("paths"))
                    .map(AuditRequest::parse_paths)
                    .unwrap_or_default();
                let tags = job.arg_str(1).or_else(|| job.kwarg_str("tags")).unwrap_or("*");
                AuditRequest::audit(paths, tags)
            }
            NovaEntry::Top => match job.arg_str(0).or_else(|| job.kwarg_str("topfile")) {
                Some(topfile) => AuditRequest::topfile(topfile),
                None => AuditRequest::top(),
            },
        };
        request.with_verbose(verbose)
    }
}

#[async_trait]
impl JobFunction for NovaFunction {
    fn name(&self) -> &str {
        match self.entry {
            NovaEntry::Audit => "nova.audit",
            NovaEntry::Top => "nova.top",
        }
    }

    async fn call(&self, job: Arc<ScheduleJob>) -> Result<Value> {
        let request = self.request(&job);
        let engine = Arc::clone(&self.engine);
        let snapshots = Arc::clone(&self.snapshots);

        let report: AuditReport = tokio::task::spawn_blocking(move || {
            let snapshot = snapshots.capture();
            engine.run(&request, &snapshot)
        })
        .await
        .map_err(|e| Error::Job {
            job: job.name.clone(),
            message: e.to_string(),
        })?;

        info!(
            job = %job.name,
            compliance = ?report.compliance_percent(),
            failures = report.failures.len(),
            "Audit job finished"
        );
        Ok(report.render())
    }
}

/// `conf.publish`: the agent configuration with secrets removed
pub struct ConfPublish {
    config: Value,
}

impl ConfPublish {
    /// Sensitive keys are stripped once, up front
    pub fn new(config: &Value) -> Self {
        Self {
            config: redact::filter_config(config),
        }
    }

    /// Whole configuration, or only the top-level keys named in `keys`
    pub fn select(&self, keys: &[&str]) -> Value {
        if keys.is_empty() {
            return self.config.clone();
        }
        let selected: Map<String, Value> = keys
            .iter()
            .filter_map(|key| self.config.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        Value::Object(selected)
    }
}

#[async_trait]
impl JobFunction for ConfPublish {
    fn name(&self) -> &str {
        "conf.publish"
    }

    async fn call(&self, job: Arc<ScheduleJob>) -> Result<Value> {
        let keys: Vec<&str> = job.args.iter().filter_map(Value::as_str).collect();
        debug!(job = %job.name, keys = ?keys, "Publishing configuration");
        Ok(self.select(&keys))
    }
}

/// Registry holding every function the agent ships
pub fn registry(
    engine: Arc<AuditEngine>,
    snapshots: Arc<dyn SnapshotSource>,
    config: &Value,
) -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions.register(Arc::new(NovaFunction::new(
        NovaEntry::Audit,
        Arc::clone(&engine),
        Arc::clone(&snapshots),
    )));
    functions.register(Arc::new(NovaFunction::new(NovaEntry::Top, engine, snapshots)));
    functions.register(Arc::new(ConfPublish::new(config)));
    functions
}
