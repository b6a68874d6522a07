//! Resource pool boundary.
//!
//! The lock step never mutates "who holds what" itself. Every change goes
//! through one of the atomic operations of [`ResourcePool`]; the pool decides
//! matching, fairness and persistence.
//!
//! When a queued request becomes satisfiable, the pool marks its resources
//! held and emits a [`Resumption`] on its channel. [`crate::LockDispatcher`]
//! turns each resumption into exactly one `proceed` call.

mod matching;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use matching::{resolve, Candidate};
pub use memory::{MemoryPool, PoolSnapshot};

use crate::{
    context::{ExecutionId, RunRef},
    resource::{ResolvedSet, ResourceInfo, ResourceRequest},
    step::LockPolicy,
    Result,
};

/// Who a lock is taken for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub execution: ExecutionId,
    pub run: RunRef,
    pub description: String,
    pub variable: Option<String>,
    pub policy: LockPolicy,
}

/// A durable wait-queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Execution to resume once the request is satisfiable
    pub execution: ExecutionId,
    /// Run the resources will be held by
    pub run: RunRef,
    /// What is requested
    pub requests: Vec<ResourceRequest>,
    /// Human-readable description
    pub description: String,
    /// Variable to expose to the body
    pub variable: Option<String>,
    /// Policy flags of the waiting step
    pub policy: LockPolicy,
    /// When the request was queued
    pub queued_at: DateTime<Utc>,
}

impl QueuedRequest {
    /// The grant a pool records when it serves this entry
    #[must_use]
    pub fn grant(&self) -> LockGrant {
        LockGrant {
            execution: self.execution,
            run: self.run.clone(),
            description: self.description.clone(),
            variable: self.variable.clone(),
            policy: self.policy,
        }
    }
}

/// A queued request the pool has just served.
///
/// The resources are already held on behalf of `request.execution`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resumption {
    pub request: QueuedRequest,
    pub resources: Vec<String>,
}

/// Operations the lock step needs from a resource pool.
#[async_trait::async_trait]
pub trait ResourcePool: Send + Sync {
    /// Create the named resource if absent. Returns whether it was created.
    async fn ensure_exists(&self, name: &str) -> Result<bool>;

    /// Resolve `requests` to free resources, without taking them.
    async fn check_availability(&self, requests: &[ResourceRequest])
        -> Result<Option<ResolvedSet>>;

    /// Atomically take every resource of `resolved`. `false` if any is taken.
    async fn lock(&self, resolved: &ResolvedSet, grant: &LockGrant) -> Result<bool>;

    /// Register a request on the wait queue.
    async fn queue(&self, request: QueuedRequest) -> Result<()>;

    /// Remove an execution from the wait queue. Returns whether it was queued.
    async fn unqueue(&self, execution: &ExecutionId) -> Result<bool>;

    /// Release the named resources held by `run`.
    async fn unlock_by_names(&self, names: &[String], run: &RunRef, policy: LockPolicy)
        -> Result<()>;

    /// Keep the named resources held when their run completes.
    async fn mark_exempt_from_release(&self, names: &[String]) -> Result<()>;

    /// Look a resource up by name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ResourceInfo>>;
}
