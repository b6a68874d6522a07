//! Body completion handling.
//!
//! | Outcome                    | Action                                       |
//! |----------------------------|----------------------------------------------|
//! | success                    | release, then `on_success(value)`            |
//! | no-release sentinel        | exempt; fail only if `keep_lock_exception_fails` |
//! | failure, unlock on error   | release, attach release error as suppressed  |
//! | failure, hold on error     | exempt, then `on_failure(error)`             |
//!
//! The callback is consumed by whichever entry point fires, and the request
//! state moves `Acquired -> Released | LeftHeld` before the pool is called, so
//! the pool sees exactly one release or exemption per request.

use std::sync::Arc;

use super::RequestCell;
use crate::{
    context::{RunRef, StepContext, StepValue},
    pool::ResourcePool,
    state::{LockRequestContext, LockState},
    step::LockPolicy,
    Error, Result,
};

/// How a body finished, classified once.
#[derive(Debug)]
pub enum BodyOutcome {
    /// Completed with a value
    Success(StepValue),
    /// Raised the "no release" sentinel
    NoRelease(String),
    /// Any other failure
    Failed(Error),
}

impl From<Result<StepValue>> for BodyOutcome {
    fn from(result: Result<StepValue>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(Error::NoReleaseLock(reason)) => Self::NoRelease(reason),
            Err(error) => Self::Failed(error),
        }
    }
}

/// Completion handler attached to a lock body.
pub struct ReleaseCallback {
    resource_names: Vec<String>,
    description: String,
    run: RunRef,
    policy: LockPolicy,
    pool: Arc<dyn ResourcePool>,
    context: Arc<dyn StepContext>,
    request: RequestCell,
}

impl ReleaseCallback {
    pub(crate) fn new(
        request: &LockRequestContext,
        pool: Arc<dyn ResourcePool>,
        context: Arc<dyn StepContext>,
        cell: RequestCell,
    ) -> Self {
        Self {
            resource_names: request.resources().to_vec(),
            description: request.description.clone(),
            run: request.run.clone(),
            policy: request.policy,
            pool,
            context,
            request: cell,
        }
    }

    /// Resources this callback settles
    #[must_use]
    pub fn resource_names(&self) -> &[String] {
        &self.resource_names
    }

    pub async fn on_success(self, value: StepValue) {
        self.complete(BodyOutcome::Success(value)).await;
    }

    pub async fn on_failure(self, error: Error) {
        self.complete(BodyOutcome::from(Err::<StepValue, _>(error))).await;
    }

    /// Settle the resources for `outcome`, then signal the step's completion.
    pub async fn complete(self, outcome: BodyOutcome) {
        match outcome {
            BodyOutcome::Success(value) => match self.release().await {
                Ok(()) => self.context.on_success(value),
                Err(error) => self.context.on_failure(error),
            },
            BodyOutcome::NoRelease(reason) => {
                let sentinel = Error::NoReleaseLock(reason);
                let exempted = self.leave_held().await;
                match (self.policy.keep_lock_exception_fails, exempted) {
                    (true, Ok(())) => self.context.on_failure(sentinel),
                    (true, Err(error)) => self.context.on_failure(sentinel.with_suppressed(error)),
                    (false, Ok(())) => {
                        tracing::debug!(
                            run = %self.run,
                            "Body kept lock on [{}], completing step",
                            self.description
                        );
                        self.context.on_success(None);
                    }
                    (false, Err(error)) => self.context.on_failure(error),
                }
            }
            BodyOutcome::Failed(error) => {
                let settled = if self.policy.unlock_on_exception {
                    self.release().await
                } else {
                    self.leave_held().await
                };
                let error = match settled {
                    Ok(()) => error,
                    Err(secondary) => error.with_suppressed(secondary),
                };
                self.context.on_failure(error);
            }
        }
    }

    async fn release(&self) -> Result<()> {
        self.request
            .update(|r| r.transition_to(LockState::Released))
            .await?;
        self.pool
            .unlock_by_names(&self.resource_names, &self.run, self.policy)
            .await?;

        self.context.log(&format!(
            "Lock released on resource [{}]",
            self.description
        ));
        tracing::debug!(run = %self.run, "Lock released on [{}]", self.description);
        Ok(())
    }

    async fn leave_held(&self) -> Result<()> {
        self.request
            .update(|r| r.transition_to(LockState::LeftHeld))
            .await?;
        self.pool
            .mark_exempt_from_release(&self.resource_names)
            .await?;

        tracing::debug!(
            run = %self.run,
            resources = ?self.resource_names,
            "Lock left held on [{}]",
            self.description
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        let outcome = BodyOutcome::from(Ok(Some(serde_json::json!(42))));
        assert!(matches!(outcome, BodyOutcome::Success(Some(_))));
    }

    #[test]
    fn test_classify_sentinel() {
        let outcome = BodyOutcome::from(Err::<StepValue, _>(Error::NoReleaseLock("handover".into())));
        assert!(matches!(outcome, BodyOutcome::NoRelease(reason) if reason == "handover"));
    }

    #[test]
    fn test_classify_failure() {
        let outcome = BodyOutcome::from(Err::<StepValue, _>(Error::Body("boom".into())));
        assert!(matches!(outcome, BodyOutcome::Failed(Error::Body(_))));
    }

    #[test]
    fn test_sentinel_wrapped_in_suppressed_is_a_failure() {
        let error = Error::NoReleaseLock("handover".into()).with_suppressed(Error::Pool("x".into()));
        assert!(matches!(BodyOutcome::from(Err::<StepValue, _>(error)), BodyOutcome::Failed(_)));
    }
}
