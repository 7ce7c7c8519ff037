//! Job definitions and the functions they invoke

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trubble_common::JobConfig;
use trubble_core::Result;

/// Immutable definition of a recurring job
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleJob {
    pub name: String,
    /// Registered function name
    pub function: String,
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub splay: Duration,
    pub run_on_start: bool,
    pub returner: Option<String>,
    pub returner_retry: bool,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl ScheduleJob {
    pub fn new(name: impl Into<String>, function: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            interval,
            splay: Duration::ZERO,
            run_on_start: false,
            returner: None,
            returner_retry: false,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Job from a `[schedule.<name>]` table
    pub fn from_config(name: impl Into<String>, config: &JobConfig) -> Self {
        Self {
            name: name.into(),
            function: config.function.clone(),
            interval: Duration::from_secs(config.seconds),
            splay: Duration::from_secs(config.splay),
            run_on_start: config.run_on_start,
            returner: config.returner.clone(),
            returner_retry: config.returner_retry,
            args: config.args.clone(),
            kwargs: config.kwargs.clone(),
        }
    }

    pub fn with_splay(mut self, splay: Duration) -> Self {
        self.splay = splay;
        self
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub fn with_returner(mut self, returner: impl Into<String>, retry: bool) -> Self {
        self.returner = Some(returner.into());
        self.returner_retry = retry;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// String argument at `index`, if present
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    /// String keyword argument, if present
    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }

    pub fn kwarg_bool(&self, key: &str) -> Option<bool> {
        self.kwargs.get(key).and_then(Value::as_bool)
    }
}

/// Something a job can invoke
#[async_trait]
pub trait JobFunction: Send + Sync {
    /// Name referenced by `function` in schedule configuration
    fn name(&self) -> &str;

    /// Run once; the value is handed to the job's returner
    async fn call(&self, job: Arc<ScheduleJob>) -> Result<Value>;
}

/// Job functions by name
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn JobFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: Arc<dyn JobFunction>) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
