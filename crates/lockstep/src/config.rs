//! Pipeline configuration
//!
//! ```toml
//! [[resources]]
//! name = "db1"
//! labels = ["db"]
//!
//! [[pipelines]]
//! name = "migrate"
//! command = "./migrate.sh \"$LOCK\""
//! timeout_secs = 600
//!
//! [pipelines.lock]
//! resource = "db1"
//! variable = "LOCK"
//! ```

use std::{collections::BTreeSet, path::Path};

use itertools::Itertools;
use lockstep_core::{Environment, LockStep};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// A resource declared up front so label requests can find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    /// Shell command run as the lock body
    pub command: Option<String>,
    /// Time to hold the lock before the command runs
    pub hold_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    /// Exit code meaning "keep my resources locked after the step"
    pub no_release_exit_code: Option<i32>,
    #[serde(default)]
    pub env: Environment,
    pub lock: LockStep,
}

impl Config {
    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The file cannot be read
    /// - The file is malformed TOML
    /// - Any pipeline or lock step fails validation
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            resources = config.resources.len(),
            pipelines = config.pipelines.len(),
            "Loaded config"
        );
        Ok(config)
    }

    /// Parse and validate config text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is malformed or fails validation
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(Error::Invalid("no pipelines declared".into()));
        }
        check_names("resource", self.resources.iter().map(|r| r.name.as_str()))?;
        check_names("pipeline", self.pipelines.iter().map(|p| p.name.as_str()))?;

        let labels: BTreeSet<&str> = self
            .resources
            .iter()
            .flat_map(|r| r.labels.iter().map(String::as_str))
            .collect();
        self.pipelines
            .iter()
            .try_for_each(|pipeline| pipeline.validate(&labels))
    }
}

impl PipelineConfig {
    fn validate(&self, declared_labels: &BTreeSet<&str>) -> Result<()> {
        if self.command.is_none() && self.hold_ms.is_none() {
            return Err(Error::Invalid(format!(
                "pipeline '{}' needs a command or hold_ms",
                self.name
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::Invalid(format!(
                "pipeline '{}' has a zero timeout",
                self.name
            )));
        }
        self.lock.validate().map_err(|source| Error::Step {
            pipeline: self.name.clone(),
            source,
        })?;

        let missing = self
            .lock
            .resources()
            .iter()
            .filter_map(|r| r.label_name().map(str::to_string))
            .filter(|label| !declared_labels.contains(label.as_str()))
            .collect_vec();
        if !missing.is_empty() {
            return Err(Error::Invalid(format!(
                "pipeline '{}' requests labels no resource carries: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

fn check_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(Error::Invalid(format!("{kind} name cannot be empty")));
        }
        if !seen.insert(name) {
            return Err(Error::Invalid(format!("duplicate {kind} name '{name}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[[resources]]
name = "db1"
labels = ["db"]

[[resources]]
name = "db2"
labels = ["db"]

[[pipelines]]
name = "migrate"
command = "echo migrating"
timeout_secs = 60

[pipelines.lock]
resource = "db1"
variable = "LOCK"

[[pipelines]]
name = "reindex"
hold_ms = 10
env = { MODE = "fast" }

[pipelines.lock]
label = "db"
quantity = 2
skip_if_locked = true
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = Config::parse(VALID).unwrap();

        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.pipelines.len(), 2);

        let migrate = &config.pipelines[0];
        assert_eq!(migrate.lock.resource.as_deref(), Some("db1"));
        assert_eq!(migrate.lock.variable_name(), Some("LOCK"));
        assert!(migrate.lock.unlock_on_exception);
        assert_eq!(migrate.timeout_secs, Some(60));

        let reindex = &config.pipelines[1];
        assert_eq!(reindex.lock.quantity, 2);
        assert!(reindex.lock.skip_if_locked);
        assert_eq!(reindex.env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn test_reject_lock_without_descriptor() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"
hold_ms = 1

[pipelines.lock]
variable = "LOCK"
"#,
        );
        assert!(matches!(result, Err(Error::Step { .. })));
    }

    #[test]
    fn test_reject_lock_with_resource_and_label() {
        let result = Config::parse(
            r#"
[[resources]]
name = "db1"
labels = ["db"]

[[pipelines]]
name = "p"
hold_ms = 1

[pipelines.lock]
extra = [{ resource = "db1", label = "db" }]
resource = "db1"
"#,
        );
        assert!(matches!(result, Err(Error::Step { .. })));
    }

    #[test]
    fn test_reject_pipeline_without_body() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"

[pipelines.lock]
resource = "db1"
"#,
        );
        assert!(matches!(result, Err(Error::Invalid(msg)) if msg.contains("command or hold_ms")));
    }

    #[test]
    fn test_reject_duplicate_pipeline_names() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"
hold_ms = 1
lock = { resource = "a" }

[[pipelines]]
name = "p"
hold_ms = 1
lock = { resource = "b" }
"#,
        );
        assert!(matches!(result, Err(Error::Invalid(msg)) if msg.contains("duplicate pipeline")));
    }

    #[test]
    fn test_reject_undeclared_label() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"
hold_ms = 1
lock = { label = "gpu", quantity = 1 }
"#,
        );
        assert!(matches!(result, Err(Error::Invalid(msg)) if msg.contains("gpu")));
    }

    #[test]
    fn test_reject_unknown_field() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"
hold_ms = 1
retries = 3
lock = { resource = "a" }
"#,
        );
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_reject_unknown_lock_flag() {
        let result = Config::parse(
            r#"
[[pipelines]]
name = "p"
hold_ms = 1

[pipelines.lock]
resource = "db1"
skipIfLocked = true
"#,
        );
        assert!(matches!(result, Err(Error::Parse(error)) if error.to_string().contains("skipIfLocked")));
    }

    #[test]
    fn test_reject_empty_config() {
        assert!(matches!(Config::parse(""), Err(Error::Invalid(_))));
    }
}
