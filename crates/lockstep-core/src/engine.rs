//! Tokio-backed execution engine.
//!
//! A [`StepHandle`] is the engine's side of one lock step: it owns the body,
//! the console log, the pause annotation and the one-shot completion. Bodies
//! run on their own task with the step's environment plus the lock override,
//! so the override exists only inside the body. A timeout or a panic in the
//! body is reported to the release callback as an ordinary failure.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::{
    context::{
        BodyInvocation, BodyStartError, Environment, ExecutionId, RunRef, StepContext, StepValue,
    },
    execution::BodyOutcome,
    Error, Result,
};

/// The nested block of a lock step.
pub type Body = Box<dyn FnOnce(Environment) -> BoxFuture<'static, Result<StepValue>> + Send>;

/// Wrap an async closure as a [`Body`].
pub fn body<F, Fut>(f: F) -> Body
where
    F: FnOnce(Environment) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<StepValue>> + Send + 'static,
{
    Box::new(move |env| Box::pin(f(env)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("body panicked: {detail}")
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine handle for one lock step execution.
pub struct StepHandle {
    id: ExecutionId,
    run: RunRef,
    environment: Environment,
    timeout: Option<Duration>,
    body: Mutex<Option<Body>>,
    console: Mutex<Vec<String>>,
    pause: Mutex<Option<String>>,
    completion: Mutex<Option<oneshot::Sender<Result<StepValue>>>>,
}

impl StepHandle {
    /// Create a handle and the future resolving to the step's result.
    pub fn new(run: RunRef, body: Body) -> (Self, StepCompletion) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            id: ExecutionId::new(),
            run,
            environment: Environment::new(),
            timeout: None,
            body: Mutex::new(Some(body)),
            console: Mutex::new(Vec::new()),
            pause: Mutex::new(None),
            completion: Mutex::new(Some(tx)),
        };
        (handle, StepCompletion(rx))
    }

    /// Base environment of the body
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Fail the body with [`Error::Timeout`] after `timeout`
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reuse a persisted execution identity
    #[must_use]
    pub const fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.id = id;
        self
    }

    /// Lines written to the console so far
    pub fn console(&self) -> Vec<String> {
        locked(&self.console).clone()
    }

    /// Label of the current pause annotation
    pub fn paused(&self) -> Option<String> {
        locked(&self.pause).clone()
    }

    /// Environment outside the body
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Whether completion has been signaled
    pub fn is_complete(&self) -> bool {
        locked(&self.completion).is_none()
    }

    fn complete(&self, result: Result<StepValue>) {
        let Some(tx) = locked(&self.completion).take() else {
            tracing::warn!(
                execution = %self.id,
                "Step completion signaled more than once, ignoring"
            );
            return;
        };
        locked(&self.pause).take();
        if tx.send(result).is_err() {
            tracing::debug!(execution = %self.id, "Step completion dropped by the engine");
        }
    }
}

impl StepContext for StepHandle {
    fn execution_id(&self) -> ExecutionId {
        self.id
    }

    fn run(&self) -> Result<RunRef> {
        Ok(self.run.clone())
    }

    fn log(&self, line: &str) {
        tracing::info!(run = %self.run, "{line}");
        locked(&self.console).push(line.to_string());
    }

    fn begin_pause(&self, label: &str) -> Result<()> {
        *locked(&self.pause) = Some(label.to_string());
        Ok(())
    }

    fn end_pause(&self) -> Result<()> {
        locked(&self.pause).take();
        Ok(())
    }

    fn start_body(&self, invocation: BodyInvocation) -> std::result::Result<(), BodyStartError> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Err(BodyStartError::new(
                Error::Engine("no async runtime to run the body on".into()),
                invocation,
            ));
        };
        let Some(body) = locked(&self.body).take() else {
            return Err(BodyStartError::new(
                Error::Engine("body already started".into()),
                invocation,
            ));
        };

        let mut environment = self.environment.clone();
        if let Some(env_override) = &invocation.environment {
            env_override.expand(&mut environment);
        }
        let timeout = self.timeout;
        let callback = invocation.callback;

        runtime.spawn(async move {
            let run_body = async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, body(environment))
                        .await
                        .unwrap_or_else(|_| {
                            Err(Error::Timeout {
                                seconds: limit.as_secs(),
                            })
                        }),
                    None => body(environment).await,
                }
            };
            let result = AssertUnwindSafe(run_body)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(Error::Body(panic_message(panic.as_ref()))));
            callback.complete(BodyOutcome::from(result)).await;
        });
        Ok(())
    }

    fn on_success(&self, value: StepValue) {
        self.complete(Ok(value));
    }

    fn on_failure(&self, error: Error) {
        self.complete(Err(error));
    }
}

/// Resolves to the step's result once the step signals completion.
#[derive(Debug)]
pub struct StepCompletion(oneshot::Receiver<Result<StepValue>>);

impl StepCompletion {
    pub async fn wait(self) -> Result<StepValue> {
        self.0.await.unwrap_or_else(|_| {
            Err(Error::Engine(
                "step handle dropped without completing".into(),
            ))
        })
    }
}

/// Convenience for sharing a handle as a [`StepContext`].
pub fn shared(handle: StepHandle) -> (Arc<StepHandle>, Arc<dyn StepContext>) {
    let handle = Arc::new(handle);
    let context: Arc<dyn StepContext> = handle.clone();
    (handle, context)
}
