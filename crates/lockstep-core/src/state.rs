//! Lock request context and its state machine.
//!
//! A [`LockRequestContext`] is plain data: it can be serialized with the
//! engine's execution state and restored after a restart. The execution
//! handle itself is only referenced by [`ExecutionId`].
//!
//! ```text
//! Requested ──► Queued ──► Acquired ──► Released
//!     │           │            └──────► LeftHeld
//!     │           └──► Abandoned
//!     ├──► Acquired
//!     ├──► Skipped
//!     └──► Abandoned
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    context::{ExecutionId, RunRef},
    pool::QueuedRequest,
    resource::ResourceRequest,
    step::{LockPolicy, LockStep},
    Error, Result,
};

/// Where one lock request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockState {
    /// Created, no decision yet
    Requested,
    /// Registered on the pool's wait queue
    Queued,
    /// Resources held, body running
    Acquired,
    /// Resources handed back to the pool
    Released,
    /// Resources exempted from release and left held
    LeftHeld,
    /// Resources were taken and the step chose not to wait
    Skipped,
    /// Stopped before the resources were granted
    Abandoned,
}

impl LockState {
    /// Check if this is a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Released | Self::LeftHeld | Self::Skipped | Self::Abandoned
        )
    }

    /// Check whether resources are held on behalf of the request
    #[must_use]
    pub const fn holds_resources(self) -> bool {
        matches!(self, Self::Acquired | Self::LeftHeld)
    }

    /// Check whether `self -> next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Requested,
                Self::Queued | Self::Acquired | Self::Skipped | Self::Abandoned
            ) | (Self::Queued, Self::Acquired | Self::Abandoned)
                | (Self::Acquired, Self::Released | Self::LeftHeld)
        )
    }
}

/// One pending or active acquisition tied to one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequestContext {
    /// Execution the request belongs to
    pub execution: ExecutionId,
    /// Run the execution belongs to
    pub run: RunRef,
    /// Descriptors of what is requested
    pub requests: Vec<ResourceRequest>,
    /// Human-readable description used in logs
    pub description: String,
    /// Variable receiving the resource names, if any
    pub variable: Option<String>,
    /// Policy flags
    pub policy: LockPolicy,
    /// When the request was created
    pub created_at: DateTime<Utc>,
    state: LockState,
    resources: Vec<String>,
    acquired_at: Option<DateTime<Utc>>,
}

impl LockRequestContext {
    /// Create a request in the `Requested` state.
    #[must_use]
    pub fn new(execution: ExecutionId, run: RunRef, step: &LockStep) -> Self {
        Self {
            execution,
            run,
            requests: step.resources(),
            description: step.to_string(),
            variable: step.variable_name().map(str::to_string),
            policy: step.policy(),
            created_at: Utc::now(),
            state: LockState::Requested,
            resources: Vec::new(),
            acquired_at: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LockState {
        self.state
    }

    /// Names of the resources held, once acquired
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    #[must_use]
    pub const fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.acquired_at
    }

    /// Move to `next`, rejecting anything the state machine does not allow.
    pub fn transition_to(&mut self, next: LockState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(
            execution = %self.execution,
            from = %self.state,
            to = %next,
            "Lock request transition"
        );
        self.state = next;
        Ok(())
    }

    /// Record the grant of `resources`.
    pub fn mark_acquired(&mut self, resources: Vec<String>) -> Result<()> {
        self.transition_to(LockState::Acquired)?;
        self.resources = resources;
        self.acquired_at = Some(Utc::now());
        Ok(())
    }

    /// The wait-queue entry describing this request
    #[must_use]
    pub fn to_queued_request(&self) -> QueuedRequest {
        QueuedRequest {
            execution: self.execution,
            run: self.run.clone(),
            requests: self.requests.clone(),
            description: self.description.clone(),
            variable: self.variable.clone(),
            policy: self.policy,
            queued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> LockRequestContext {
        LockRequestContext::new(
            ExecutionId::new(),
            RunRef::new("deploy", 1),
            &LockStep::resource("db1").with_variable("LOCK"),
        )
    }

    #[test]
    fn test_new_context_is_requested() {
        let ctx = context();
        assert_eq!(ctx.state(), LockState::Requested);
        assert_eq!(ctx.description, "db1");
        assert_eq!(ctx.variable.as_deref(), Some("LOCK"));
        assert!(ctx.resources().is_empty());
    }

    #[test]
    fn test_queued_then_acquired_then_released() -> Result<()> {
        let mut ctx = context();
        ctx.transition_to(LockState::Queued)?;
        ctx.mark_acquired(vec!["db1".into()])?;
        assert_eq!(ctx.resources(), ["db1".to_string()]);
        assert!(ctx.acquired_at().is_some());
        ctx.transition_to(LockState::Released)?;
        assert!(ctx.state().is_terminal());
        Ok(())
    }

    #[test]
    fn test_no_double_release() -> Result<()> {
        let mut ctx = context();
        ctx.mark_acquired(vec!["db1".into()])?;
        ctx.transition_to(LockState::Released)?;
        assert!(matches!(
            ctx.transition_to(LockState::Released),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(ctx.transition_to(LockState::LeftHeld).is_err());
        Ok(())
    }

    #[test]
    fn test_no_requeue_after_acquire() -> Result<()> {
        let mut ctx = context();
        ctx.mark_acquired(vec!["db1".into()])?;
        assert!(ctx.transition_to(LockState::Queued).is_err());
        assert!(ctx.transition_to(LockState::Abandoned).is_err());
        Ok(())
    }

    #[test]
    fn test_abandoned_cannot_acquire() -> Result<()> {
        let mut ctx = context();
        ctx.transition_to(LockState::Queued)?;
        ctx.transition_to(LockState::Abandoned)?;
        assert!(ctx.mark_acquired(vec!["db1".into()]).is_err());
        assert!(ctx.resources().is_empty());
        Ok(())
    }

    #[test]
    fn test_state_display_and_parse() {
        assert_eq!(LockState::LeftHeld.to_string(), "left_held");
        assert_eq!("queued".parse::<LockState>().ok(), Some(LockState::Queued));
    }

    #[test]
    fn test_context_serde_roundtrip() -> std::result::Result<(), serde_json::Error> {
        let ctx = context();
        let json = serde_json::to_string(&ctx)?;
        let restored: LockRequestContext = serde_json::from_str(&json)?;
        assert_eq!(restored, ctx);
        Ok(())
    }
}
