//! The lock step execution.
//!
//! [`LockStepExecution::start`] is the acquire phase, [`LockStepExecution::proceed`]
//! the asynchronous resume entry point used by the dispatcher, and
//! [`LockStepExecution::stop`] the cancellation handler. Body completion is
//! handled by [`ReleaseCallback`].

mod callback;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use callback::{BodyOutcome, ReleaseCallback};

use crate::{
    context::{BodyInvocation, EnvironmentOverride, ExecutionId, RunRef, StepContext},
    pool::{LockGrant, ResourcePool, Resumption},
    resource::{ResolvedSet, ResourceRequest},
    state::{LockRequestContext, LockState},
    step::{LockPolicy, LockStep},
    Error, Result,
};

/// How [`LockStepExecution::start`] left the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Resources taken, body started
    Acquired,
    /// Waiting on the pool's queue
    Queued,
    /// Resources taken by someone else, step completed as a no-op
    Skipped,
}

impl StartOutcome {
    /// Whether the step already signaled its completion
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Shared cell holding the request once the step has started.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestCell(Arc<Mutex<Option<LockRequestContext>>>);

impl RequestCell {
    fn with(request: LockRequestContext) -> Self {
        Self(Arc::new(Mutex::new(Some(request))))
    }

    pub(crate) async fn update<T>(
        &self,
        f: impl FnOnce(&mut LockRequestContext) -> Result<T> + Send,
    ) -> Result<T> {
        let mut guard = self.0.lock().await;
        let request = guard
            .as_mut()
            .ok_or_else(|| Error::Engine("lock step has not started".into()))?;
        f(request)
    }

    async fn snapshot(&self) -> Option<LockRequestContext> {
        self.0.lock().await.clone()
    }
}

/// One lock step bound to one engine execution.
pub struct LockStepExecution {
    step: LockStep,
    pool: Arc<dyn ResourcePool>,
    context: Arc<dyn StepContext>,
    request: RequestCell,
}

impl LockStepExecution {
    #[must_use]
    pub fn new(step: LockStep, context: Arc<dyn StepContext>, pool: Arc<dyn ResourcePool>) -> Self {
        Self {
            step,
            pool,
            context,
            request: RequestCell::default(),
        }
    }

    /// Rebuild an execution from a persisted request after a restart.
    pub fn restore(
        step: LockStep,
        request: LockRequestContext,
        context: Arc<dyn StepContext>,
        pool: Arc<dyn ResourcePool>,
    ) -> Result<Self> {
        if request.execution != context.execution_id() {
            return Err(Error::Engine(format!(
                "Persisted lock request belongs to execution {}, not {}",
                request.execution,
                context.execution_id()
            )));
        }
        Ok(Self {
            step,
            pool,
            context,
            request: RequestCell::with(request),
        })
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.context.execution_id()
    }

    #[must_use]
    pub const fn step(&self) -> &LockStep {
        &self.step
    }

    /// The request as plain data, once started
    pub async fn snapshot(&self) -> Option<LockRequestContext> {
        self.request.snapshot().await
    }

    pub async fn state(&self) -> Option<LockState> {
        self.request.snapshot().await.map(|r| r.state())
    }

    /// Acquire phase.
    ///
    /// Takes the resources and starts the body, completes the step as a no-op
    /// (`skip_if_locked`), or registers the request on the wait queue.
    /// Register the execution with the dispatcher before calling this: the
    /// pool may serve the queued request before `start` returns.
    pub async fn start(&self) -> Result<StartOutcome> {
        self.step.validate()?;
        let run = self.context.run()?;
        self.begin(&run).await?;

        self.context.begin_pause("Lock")?;
        self.context
            .log(&format!("Trying to acquire lock on [{}]", self.step));

        let requests = self.step.resources();
        for name in requests.iter().filter_map(ResourceRequest::resource_name) {
            if self.pool.ensure_exists(name).await? {
                self.context
                    .log(&format!("Resource [{name}] did not exist. Created."));
            }
        }

        if let Some(resolved) = self.try_lock(&requests, &run).await? {
            let resources = resolved.into_names();
            let accepted = self
                .request
                .update(|r| {
                    r.mark_acquired(resources.clone())?;
                    Ok(r.clone())
                })
                .await;
            return match accepted {
                Ok(request) => {
                    self.resume(request).await;
                    Ok(StartOutcome::Acquired)
                }
                Err(error) => {
                    self.hand_back(&resources, &run, self.step.policy()).await;
                    Err(error)
                }
            };
        }

        let holder = self.current_holder(&requests).await;
        let locked = holder.map_or_else(
            || format!("[{}] is locked", self.step),
            |holder| format!("[{}] is locked by {holder}", self.step),
        );

        if self.step.skip_if_locked {
            self.context.log(&format!("{locked}, skipping execution..."));
            self.request
                .update(|r| r.transition_to(LockState::Skipped))
                .await?;
            self.context.on_success(None);
            return Ok(StartOutcome::Skipped);
        }

        self.context.log(&format!("{locked}, waiting..."));
        let entry = self
            .request
            .update(|r| {
                r.transition_to(LockState::Queued)?;
                Ok(r.to_queued_request())
            })
            .await?;
        if let Err(error) = self.pool.queue(entry).await {
            if let Err(e) = self
                .request
                .update(|r| r.transition_to(LockState::Abandoned))
                .await
            {
                tracing::warn!(error = %e, "Could not abandon lock request after queue failure");
            }
            return Err(error);
        }

        Ok(StartOutcome::Queued)
    }

    /// Resume entry point for a queued request the pool has served.
    ///
    /// A resumption for a request that is no longer waiting is refused and its
    /// resources are handed back to the pool.
    pub async fn proceed(&self, resumption: Resumption) {
        let Resumption { request, resources } = resumption;
        let accepted = self
            .request
            .update(|r| {
                r.mark_acquired(resources.clone())?;
                Ok(r.clone())
            })
            .await;

        match accepted {
            Ok(acquired) => self.resume(acquired).await,
            Err(error) => {
                tracing::warn!(
                    execution = %request.execution,
                    error = %error,
                    "Refusing resumption of a lock request that is not waiting"
                );
                self.hand_back(&resources, &request.run, request.policy)
                    .await;
            }
        }
    }

    /// Cancellation handler: drop the request from the wait queue and fail
    /// the step with `cause`. Never fails itself.
    ///
    /// A request the pool already served but that has not resumed yet is
    /// abandoned too, so its in-flight resumption is handed back.
    pub async fn stop(&self, cause: Error) {
        let execution = self.execution_id();
        match self.pool.unqueue(&execution).await {
            Ok(true) => {
                if let Err(error) = self
                    .request
                    .update(|r| r.transition_to(LockState::Abandoned))
                    .await
                {
                    tracing::warn!(execution = %execution, error = %error, "Unqueued lock request in unexpected state");
                }
            }
            Ok(false) => {
                if self.abandon_if_waiting().await {
                    tracing::debug!(
                        execution = %execution,
                        "Lock request served but not yet resumed, abandoning it"
                    );
                } else {
                    tracing::warn!(
                        execution = %execution,
                        "Cannot remove context from lockable resource waiting list. The context is not in the waiting list."
                    );
                }
            }
            Err(error) => {
                let abandoned = self.abandon_if_waiting().await;
                tracing::warn!(
                    execution = %execution,
                    error = %error,
                    abandoned,
                    "Failed to remove context from lockable resource waiting list"
                );
            }
        }
        self.context.on_failure(cause);
    }

    /// Move a request that has not acquired yet to `Abandoned`.
    async fn abandon_if_waiting(&self) -> bool {
        self.request
            .update(|r| match r.state() {
                LockState::Requested | LockState::Queued => {
                    r.transition_to(LockState::Abandoned)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
            .unwrap_or(false)
    }

    async fn begin(&self, run: &RunRef) -> Result<()> {
        let mut guard = self.request.0.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Err(Error::Engine(format!(
                "Lock step already started (state: {})",
                existing.state()
            )));
        }
        *guard = Some(LockRequestContext::new(
            self.execution_id(),
            run.clone(),
            &self.step,
        ));
        Ok(())
    }

    async fn try_lock(
        &self,
        requests: &[ResourceRequest],
        run: &RunRef,
    ) -> Result<Option<ResolvedSet>> {
        let Some(available) = self.pool.check_availability(requests).await? else {
            return Ok(None);
        };

        let grant = LockGrant {
            execution: self.execution_id(),
            run: run.clone(),
            description: self.step.to_string(),
            variable: self.step.variable_name().map(str::to_string),
            policy: self.step.policy(),
        };
        let locked = self.pool.lock(&available, &grant).await?;
        Ok(locked.then_some(available))
    }

    /// Holder of the first named resource, for the skip/wait notice.
    async fn current_holder(&self, requests: &[ResourceRequest]) -> Option<String> {
        let name = requests.iter().find_map(ResourceRequest::resource_name)?;
        match self.pool.find_by_name(name).await {
            Ok(info) => info.and_then(|i| i.current_holder),
            Err(error) => {
                tracing::debug!(resource = %name, error = %error, "Could not look up resource holder");
                None
            }
        }
    }

    /// Resume phase: expose the resources and start the body.
    async fn resume(&self, request: LockRequestContext) {
        let callback = ReleaseCallback::new(
            &request,
            Arc::clone(&self.pool),
            Arc::clone(&self.context),
            self.request.clone(),
        );

        let run = match self.context.run() {
            Ok(run) => run,
            Err(error) => {
                callback.on_failure(error).await;
                return;
            }
        };

        self.context
            .log(&format!("Lock acquired on [{}]", request.description));
        tracing::debug!(
            run = %run.external_id(),
            execution = %request.execution,
            resources = ?request.resources(),
            "Lock acquired on [{}]",
            request.description
        );

        if let Err(error) = self.context.end_pause() {
            callback.on_failure(error).await;
            return;
        }

        let environment = request
            .variable
            .as_deref()
            .map(|variable| EnvironmentOverride::for_resources(variable, request.resources()));

        if let Err(rejected) = self.context.start_body(BodyInvocation {
            environment,
            callback,
        }) {
            tracing::warn!(
                execution = %request.execution,
                error = %rejected.error,
                "Engine refused to start the lock body"
            );
            rejected.invocation.callback.on_failure(rejected.error).await;
        }
    }

    async fn hand_back(&self, resources: &[String], run: &RunRef, policy: LockPolicy) {
        if let Err(error) = self.pool.unlock_by_names(resources, run, policy).await {
            tracing::warn!(
                run = %run,
                resources = ?resources,
                error = %error,
                "Failed to hand resources back to the pool"
            );
        }
    }
}
