//! # Lockstep Core
//!
//! Resource lock step for pipeline engines: a step acquires named or labeled
//! resources, runs a nested body while holding them, and releases them
//! according to a success/failure/cancellation policy.
//!
//! ## Flow
//!
//! ```text
//! start ──► available ──► proceed ──► body ──► ReleaseCallback ──► pool
//!   │                        ▲
//!   ├─► skip_if_locked ──► success(None)
//!   └─► queue ──► (pool grants later) ──► LockDispatcher
//! ```
//!
//! ## Collaborators
//!
//! - [`ResourcePool`]: owns "who holds what" and the wait queue. [`MemoryPool`]
//!   is the in-process reference implementation.
//! - [`StepContext`]: the engine's handle for one suspendable execution.
//!   [`engine::StepHandle`] is a tokio-backed implementation.
//!
//! ## Laws
//!
//! - No `unwrap()` / `expect()` / `panic!()` outside tests
//! - No `unsafe`

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod execution;
pub mod pool;
pub mod resource;
pub mod state;
pub mod step;

pub use context::{
    BodyInvocation, BodyStartError, Environment, EnvironmentOverride, ExecutionId, RunRef,
    StepContext, StepValue,
};
pub use dispatch::LockDispatcher;
pub use error::{Error, Result};
pub use execution::{BodyOutcome, LockStepExecution, ReleaseCallback, StartOutcome};
pub use pool::{
    LockGrant, MemoryPool, PoolSnapshot, QueuedRequest, ResourcePool, Resumption,
};
pub use resource::{ResolvedSet, ResourceInfo, ResourceRequest};
pub use state::{LockRequestContext, LockState};
pub use step::{LockPolicy, LockStep};
