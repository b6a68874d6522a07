//! Engine-facing types: execution identity, run identity, environment
//! overrides and the [`StepContext`] handle trait.
//!
//! The engine owns every execution handle. The lock step only references one
//! through `Arc<dyn StepContext>` and identifies it in durable data by
//! [`ExecutionId`].

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{execution::ReleaseCallback, Error, Result};

/// Value a step completes with. `None` is the null result.
pub type StepValue = Option<serde_json::Value>;

/// Environment visible to a body.
pub type Environment = BTreeMap<String, String>;

/// Stable identity of one suspendable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Create a fresh execution ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a pipeline run (one build of one pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunRef {
    /// Pipeline name
    pub pipeline: String,
    /// Build number within the pipeline
    pub number: u64,
}

impl RunRef {
    #[must_use]
    pub fn new(pipeline: impl Into<String>, number: u64) -> Self {
        Self {
            pipeline: pipeline.into(),
            number,
        }
    }

    /// `pipeline#number`, stable across restarts
    #[must_use]
    pub fn external_id(&self) -> String {
        format!("{}#{}", self.pipeline, self.number)
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pipeline, self.number)
    }
}

/// A variable set for the duration of a body only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentOverride {
    pub variable: String,
    pub value: String,
}

impl EnvironmentOverride {
    /// Expose `names` comma-joined under `variable`.
    #[must_use]
    pub fn for_resources(variable: impl Into<String>, names: &[String]) -> Self {
        Self {
            variable: variable.into(),
            value: names.join(","),
        }
    }

    /// Apply the override to an environment.
    pub fn expand(&self, env: &mut Environment) {
        tracing::trace!(
            variable = %self.variable,
            value = %self.value,
            "Setting variable for the duration of the block"
        );
        env.insert(self.variable.clone(), self.value.clone());
    }
}

/// Everything the engine needs to start a body.
pub struct BodyInvocation {
    /// Override merged into the body's environment
    pub environment: Option<EnvironmentOverride>,
    /// Completion handler; consumed by exactly one of its entry points
    pub callback: ReleaseCallback,
}

impl fmt::Debug for BodyInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyInvocation")
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// The engine could not start a body.
///
/// The invocation is handed back so its callback can still settle the held
/// resources.
#[derive(Debug)]
pub struct BodyStartError {
    pub error: Error,
    pub invocation: BodyInvocation,
}

impl BodyStartError {
    #[must_use]
    pub const fn new(error: Error, invocation: BodyInvocation) -> Self {
        Self { error, invocation }
    }
}

/// Handle for one suspendable execution, owned by the engine.
///
/// Completion signaling (`on_success` / `on_failure`) takes effect at most
/// once per handle; implementations ignore later calls.
pub trait StepContext: Send + Sync {
    /// Identity used to key queue entries and resumptions
    fn execution_id(&self) -> ExecutionId;

    /// The run this execution belongs to
    fn run(&self) -> Result<RunRef>;

    /// Write a line to the step's console log
    fn log(&self, line: &str);

    /// Attach a pause annotation to the execution's flow node
    fn begin_pause(&self, label: &str) -> Result<()>;

    /// End the current pause annotation, if any
    fn end_pause(&self) -> Result<()>;

    /// Start the nested body. Completion is reported through the callback.
    fn start_body(&self, invocation: BodyInvocation) -> std::result::Result<(), BodyStartError>;

    /// Complete the step successfully
    fn on_success(&self, value: StepValue);

    /// Complete the step with a failure
    fn on_failure(&self, error: Error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_joins_names() {
        let names = vec!["db1".to_string(), "db2".to_string()];
        let env_override = EnvironmentOverride::for_resources("LOCK", &names);
        assert_eq!(env_override.value, "db1,db2");

        let mut env = Environment::new();
        env_override.expand(&mut env);
        assert_eq!(env.get("LOCK").map(String::as_str), Some("db1,db2"));
    }

    #[test]
    fn test_run_ref_external_id() {
        let run = RunRef::new("deploy", 7);
        assert_eq!(run.external_id(), "deploy#7");
        assert_eq!(run.to_string(), "deploy#7");
    }

    #[test]
    fn test_execution_ids_are_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }
}
