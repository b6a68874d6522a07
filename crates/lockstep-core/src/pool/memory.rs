//! In-process reference pool.
//!
//! Resources and the wait queue live behind one `tokio::sync::Mutex`, so every
//! operation is atomic with respect to every other. Served waiters are
//! announced on an unbounded channel of [`Resumption`]s.
//!
//! Waiter selection: oldest queued request first. A release by a step with
//! `inverse_precedence` serves the newest satisfiable request first instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::{matching, Candidate, LockGrant, QueuedRequest, ResourcePool, Resumption};
use crate::{
    context::{ExecutionId, RunRef},
    resource::{ResolvedSet, ResourceInfo, ResourceRequest},
    step::LockPolicy,
    Error, Result,
};

#[derive(Debug, Clone)]
struct Holder {
    run: RunRef,
    description: String,
}

#[derive(Debug, Clone)]
struct Resource {
    name: String,
    labels: Vec<String>,
    holder: Option<Holder>,
    exempt: bool,
}

impl Resource {
    fn new(name: &str, labels: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            labels,
            holder: None,
            exempt: false,
        }
    }

    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            name: self.name.clone(),
            labels: self.labels.clone(),
            holder_run: self.holder.as_ref().map(|h| h.run.clone()),
            current_holder: self
                .holder
                .as_ref()
                .map(|h| format!("{} ({})", h.run, h.description)),
            exempt: self.exempt,
        }
    }

    fn release(&mut self) {
        self.holder = None;
        self.exempt = false;
    }
}

impl Candidate for Resource {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    resources: BTreeMap<String, Resource>,
    queue: Vec<QueuedRequest>,
}

impl PoolState {
    fn hold(&mut self, names: &[String], grant: &LockGrant) {
        for name in names {
            if let Some(resource) = self.resources.get_mut(name) {
                resource.holder = Some(Holder {
                    run: grant.run.clone(),
                    description: grant.description.clone(),
                });
            }
        }
    }

    fn free(&mut self, names: &[String]) {
        for name in names {
            if let Some(resource) = self.resources.get_mut(name) {
                resource.release();
            }
        }
    }

    /// Index and resolution of the next waiter that can be served.
    fn next_waiter(&self, inverse_precedence: bool) -> Option<(usize, ResolvedSet)> {
        let resolve_at = |index: usize| {
            matching::resolve(&self.resources, &self.queue[index].requests).map(|set| (index, set))
        };
        if inverse_precedence {
            (0..self.queue.len()).rev().find_map(resolve_at)
        } else {
            (0..self.queue.len()).find_map(resolve_at)
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub resources: Vec<ResourceInfo>,
    pub queued: Vec<QueuedRequest>,
}

/// Reference [`ResourcePool`] kept in memory.
#[derive(Debug)]
pub struct MemoryPool {
    state: Mutex<PoolState>,
    resumptions: mpsc::UnboundedSender<Resumption>,
}

impl MemoryPool {
    /// Create an empty pool and the receiving end of its resumption channel.
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Resumption>) {
        let (resumptions, rx) = mpsc::unbounded_channel();
        let pool = Self {
            state: Mutex::new(PoolState::default()),
            resumptions,
        };
        (pool, rx)
    }

    /// Declare a resource with its labels, replacing the labels if it exists.
    pub async fn declare(&self, name: &str, labels: Vec<String>) {
        let mut state = self.state.lock().await;
        match state.resources.get_mut(name) {
            Some(resource) => resource.labels = labels,
            None => {
                state
                    .resources
                    .insert(name.to_string(), Resource::new(name, labels));
            }
        }
    }

    /// Auto-release at run completion: free everything `run` holds except
    /// exempted resources. Returns the freed names.
    pub async fn complete_run(&self, run: &RunRef) -> Vec<String> {
        let mut state = self.state.lock().await;
        let freed: Vec<String> = state
            .resources
            .values()
            .filter(|r| !r.exempt && r.holder.as_ref().is_some_and(|h| &h.run == run))
            .map(|r| r.name.clone())
            .collect();
        state.free(&freed);

        if !freed.is_empty() {
            tracing::debug!(run = %run, resources = ?freed, "Released resources at run completion");
            self.serve_waiters(&mut state, false);
        }
        freed
    }

    /// Number of requests waiting
    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Point-in-time view of resources and waiters
    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        PoolSnapshot {
            resources: state.resources.values().map(Resource::info).collect(),
            queued: state.queue.clone(),
        }
    }

    /// Serve as many waiters as the current holdings allow.
    fn serve_waiters(&self, state: &mut PoolState, inverse_precedence: bool) -> usize {
        let mut served = 0;

        while let Some((index, resolved)) = state.next_waiter(inverse_precedence) {
            let waiter = state.queue.remove(index);
            let names = resolved.into_names();
            state.hold(&names, &waiter.grant());

            tracing::debug!(
                execution = %waiter.execution,
                run = %waiter.run,
                resources = ?names,
                "Serving queued lock request"
            );

            let resumption = Resumption {
                request: waiter,
                resources: names,
            };
            if let Err(mpsc::error::SendError(unsent)) = self.resumptions.send(resumption) {
                tracing::warn!(
                    execution = %unsent.request.execution,
                    "Resumption channel closed, keeping request queued"
                );
                state.free(&unsent.resources);
                state.queue.insert(index, unsent.request);
                break;
            }
            served += 1;
        }

        served
    }
}

#[async_trait::async_trait]
impl ResourcePool for MemoryPool {
    async fn ensure_exists(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.resources.contains_key(name) {
            return Ok(false);
        }
        state
            .resources
            .insert(name.to_string(), Resource::new(name, Vec::new()));
        tracing::debug!(resource = %name, "Created resource");
        Ok(true)
    }

    async fn check_availability(
        &self,
        requests: &[ResourceRequest],
    ) -> Result<Option<ResolvedSet>> {
        let state = self.state.lock().await;
        Ok(matching::resolve(&state.resources, requests))
    }

    async fn lock(&self, resolved: &ResolvedSet, grant: &LockGrant) -> Result<bool> {
        let mut state = self.state.lock().await;
        let all_free = resolved
            .names()
            .iter()
            .all(|name| state.resources.get(name).is_some_and(Candidate::is_free));
        if !all_free {
            return Ok(false);
        }

        state.hold(resolved.names(), grant);
        tracing::debug!(
            execution = %grant.execution,
            run = %grant.run,
            resources = ?resolved.names(),
            "Locked resources"
        );
        Ok(true)
    }

    async fn queue(&self, request: QueuedRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.queue.iter().any(|q| q.execution == request.execution) {
            return Err(Error::Pool(format!(
                "Execution {} is already queued",
                request.execution
            )));
        }

        tracing::debug!(
            execution = %request.execution,
            description = %request.description,
            "Queued lock request"
        );
        state.queue.push(request);
        // Resources may have been freed between the failed lock and now.
        self.serve_waiters(&mut state, false);
        Ok(())
    }

    async fn unqueue(&self, execution: &ExecutionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let position = state.queue.iter().position(|q| &q.execution == execution);
        Ok(position.map(|index| state.queue.remove(index)).is_some())
    }

    async fn unlock_by_names(
        &self,
        names: &[String],
        run: &RunRef,
        policy: LockPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let owned: Vec<String> = names
            .iter()
            .filter(|name| {
                state
                    .resources
                    .get(name.as_str())
                    .and_then(|r| r.holder.as_ref())
                    .is_some_and(|h| &h.run == run)
            })
            .cloned()
            .collect();

        if owned.len() != names.len() {
            tracing::debug!(
                run = %run,
                requested = ?names,
                owned = ?owned,
                "Some resources are not held by this run"
            );
        }

        state.free(&owned);
        self.serve_waiters(&mut state, policy.inverse_precedence);
        Ok(())
    }

    async fn mark_exempt_from_release(&self, names: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for name in names {
            let resource = state
                .resources
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("Resource '{name}'")))?;
            resource.exempt = true;
        }
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ResourceInfo>> {
        let state = self.state.lock().await;
        Ok(state.resources.get(name).map(Resource::info))
    }
}
