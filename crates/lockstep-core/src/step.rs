//! Lock step parameters
//!
//! A [`LockStep`] is what a pipeline author writes: one primary resource or
//! label, optional extra descriptors, the variable to expose, and the policy
//! flags. Everything is immutable once the step starts.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{resource::ResourceRequest, Error, Result};

/// Policy flags fixed at step configuration time.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Complete as a no-op instead of waiting when resources are taken
    pub skip_if_locked: bool,
    /// Forwarded to the pool's waiter selection
    pub inverse_precedence: bool,
    /// Release even when the body fails
    pub unlock_on_exception: bool,
    /// Report the step as failed when the body keeps its lock
    pub keep_lock_exception_fails: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            skip_if_locked: false,
            inverse_precedence: false,
            unlock_on_exception: true,
            keep_lock_exception_fails: false,
        }
    }
}

/// Parameters of one lock step.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockStep {
    /// Primary resource name
    pub resource: Option<String>,
    /// Primary label
    pub label: Option<String>,
    /// Quantity for the primary label (0 = all)
    pub quantity: u32,
    /// Additional descriptors locked together with the primary one
    pub extra: Vec<ResourceRequest>,
    /// Environment variable receiving the locked resource names
    pub variable: Option<String>,
    pub inverse_precedence: bool,
    pub skip_if_locked: bool,
    pub unlock_on_exception: bool,
    pub keep_lock_exception_fails: bool,
}

impl Default for LockStep {
    fn default() -> Self {
        let policy = LockPolicy::default();
        Self {
            resource: None,
            label: None,
            quantity: 0,
            extra: Vec::new(),
            variable: None,
            inverse_precedence: policy.inverse_precedence,
            skip_if_locked: policy.skip_if_locked,
            unlock_on_exception: policy.unlock_on_exception,
            keep_lock_exception_fails: policy.keep_lock_exception_fails,
        }
    }
}

impl LockStep {
    /// Lock a single resource by name
    #[must_use]
    pub fn resource(name: impl Into<String>) -> Self {
        Self {
            resource: Some(name.into()),
            ..Self::default()
        }
    }

    /// Lock `quantity` resources carrying `label`
    #[must_use]
    pub fn label(label: impl Into<String>, quantity: u32) -> Self {
        Self {
            label: Some(label.into()),
            quantity,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_extra(mut self, request: ResourceRequest) -> Self {
        self.extra.push(request);
        self
    }

    #[must_use]
    pub fn with_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = Some(variable.into());
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.skip_if_locked = policy.skip_if_locked;
        self.inverse_precedence = policy.inverse_precedence;
        self.unlock_on_exception = policy.unlock_on_exception;
        self.keep_lock_exception_fails = policy.keep_lock_exception_fails;
        self
    }

    /// The policy flags of this step
    #[must_use]
    pub const fn policy(&self) -> LockPolicy {
        LockPolicy {
            skip_if_locked: self.skip_if_locked,
            inverse_precedence: self.inverse_precedence,
            unlock_on_exception: self.unlock_on_exception,
            keep_lock_exception_fails: self.keep_lock_exception_fails,
        }
    }

    /// All descriptors: the primary one (if any) followed by `extra`.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceRequest> {
        let primary = (self.resource.is_some() || self.label.is_some()).then(|| ResourceRequest {
            resource: self.resource.clone(),
            label: self.label.clone(),
            quantity: self.quantity,
        });
        primary.into_iter().chain(self.extra.iter().cloned()).collect()
    }

    /// The variable name, ignoring blank values
    #[must_use]
    pub fn variable_name(&self) -> Option<&str> {
        self.variable
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Validate the step before any lock attempt.
    pub fn validate(&self) -> Result<()> {
        let resources = self.resources();
        if resources.is_empty() {
            return Err(Error::InvalidConfig(
                "Either a resource name or a label must be specified".into(),
            ));
        }
        resources.iter().try_for_each(ResourceRequest::validate)?;

        match self.variable_name() {
            Some(variable) if !is_env_name(variable) => Err(Error::InvalidConfig(format!(
                "'{variable}' is not a valid environment variable name"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for LockStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resources().iter().join(", "))
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_descriptors() {
        let step = LockStep::resource("db1").with_extra(ResourceRequest::labeled("rig", 2));
        assert_eq!(step.to_string(), "db1, Label: rig, Quantity: 2");
    }

    #[test]
    fn test_resources_without_primary() {
        let step = LockStep::default().with_extra(ResourceRequest::named("db2"));
        assert_eq!(step.resources(), vec![ResourceRequest::named("db2")]);
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_step() {
        assert!(matches!(
            LockStep::default().validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_variable() {
        assert!(LockStep::resource("db1")
            .with_variable("1LOCK")
            .validate()
            .is_err());
        assert!(LockStep::resource("db1")
            .with_variable("LOCK-NAME")
            .validate()
            .is_err());
        assert!(LockStep::resource("db1")
            .with_variable("_LOCK_1")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_blank_variable_is_ignored() {
        let step = LockStep::resource("db1").with_variable("  ");
        assert_eq!(step.variable_name(), None);
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_default_policy_unlocks_on_exception() {
        let policy = LockStep::resource("db1").policy();
        assert!(policy.unlock_on_exception);
        assert!(!policy.skip_if_locked);
        assert!(!policy.keep_lock_exception_fails);
    }

    #[test]
    fn test_deserialize_defaults() -> std::result::Result<(), serde_json::Error> {
        let step: LockStep = serde_json::from_str(r#"{"resource": "db1", "variable": "LOCK"}"#)?;
        assert_eq!(step.resource.as_deref(), Some("db1"));
        assert!(step.unlock_on_exception);
        assert_eq!(step.variable_name(), Some("LOCK"));
        Ok(())
    }

    #[test]
    fn test_deserialize_rejects_unknown_flags() {
        let step = serde_json::from_str::<LockStep>(r#"{"resource": "db1", "skipIfLocked": true}"#);
        assert!(step.is_err());

        let extra = serde_json::from_str::<LockStep>(
            r#"{"resource": "db1", "extra": [{"label": "rig", "qty": 2}]}"#,
        );
        assert!(extra.is_err());
    }
}
