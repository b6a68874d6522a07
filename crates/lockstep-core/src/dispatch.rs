//! Resumption dispatcher.
//!
//! The pool announces every served queued request on a channel. The
//! dispatcher owns the receiving end: it looks the execution up in its
//! registry and spawns one task per resumption calling
//! [`LockStepExecution::proceed`]. A resumption for an execution nobody
//! registered is handed straight back to the pool.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};

use crate::{
    context::ExecutionId, execution::LockStepExecution, pool::ResourcePool, pool::Resumption,
};

type Registry = Arc<RwLock<HashMap<ExecutionId, Arc<LockStepExecution>>>>;

/// Routes pool resumptions to registered executions.
#[derive(Clone)]
pub struct LockDispatcher {
    executions: Registry,
    pool: Arc<dyn ResourcePool>,
}

impl LockDispatcher {
    #[must_use]
    pub fn new(pool: Arc<dyn ResourcePool>) -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            pool,
        }
    }

    /// Make an execution reachable by resumptions.
    pub async fn register(&self, execution: Arc<LockStepExecution>) {
        let mut executions = self.executions.write().await;
        executions.insert(execution.execution_id(), execution);
    }

    /// Remove an execution once its step completed.
    pub async fn deregister(&self, id: &ExecutionId) -> Option<Arc<LockStepExecution>> {
        let mut executions = self.executions.write().await;
        executions.remove(id)
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<Arc<LockStepExecution>> {
        let executions = self.executions.read().await;
        executions.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    /// Consume `resumptions` until the channel closes.
    pub fn spawn(&self, mut resumptions: mpsc::UnboundedReceiver<Resumption>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(resumption) = resumptions.recv().await {
                dispatcher.deliver(resumption).await;
            }
            tracing::debug!("Resumption channel closed, dispatcher stopping");
        })
    }

    /// Route one resumption.
    pub async fn deliver(&self, resumption: Resumption) {
        let execution = resumption.request.execution;
        if let Some(target) = self.get(&execution).await {
            tokio::spawn(async move {
                target.proceed(resumption).await;
            });
            return;
        }

        tracing::warn!(
            execution = %execution,
            resources = ?resumption.resources,
            "Resumption for unknown execution, handing resources back"
        );
        let Resumption { request, resources } = resumption;
        if let Err(error) = self
            .pool
            .unlock_by_names(&resources, &request.run, request.policy)
            .await
        {
            tracing::warn!(
                execution = %execution,
                error = %error,
                "Failed to hand resources back to the pool"
            );
        }
    }
}
