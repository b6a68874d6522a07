//! Error types for lockstep-core
//!
//! One enum covers the whole taxonomy of a lock step:
//! - configuration errors (raised before any lock attempt)
//! - engine-context errors (run or flow handle unusable)
//! - the "no release" sentinel raised by a body that hands its lock on
//! - body failures and engine-imposed timeouts
//! - pool errors, including secondary errors raised while releasing
//!
//! Secondary errors never replace the original failure. They are attached
//! with [`Error::with_suppressed`] and reachable through [`Error::suppressed`].

use itertools::Itertools;
use thiserror::Error;

use crate::state::LockState;

/// Core error type for lock step operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed step or resource descriptor
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine could not resolve the run, flow node or body invoker
    #[error("Engine error: {0}")]
    Engine(String),

    /// Raised by a body to keep its resources held past the step
    #[error("Lock kept without release: {0}")]
    NoReleaseLock(String),

    /// Ordinary failure of the nested body
    #[error("Body failed: {0}")]
    Body(String),

    /// The engine gave up waiting for the body
    #[error("Body timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Resource pool errors
    #[error("Resource pool error: {0}")]
    Pool(String),

    /// The step was stopped by the engine
    #[error("Stopped: {0}")]
    Stopped(String),

    /// Lock state machine violation
    #[error("Invalid lock state transition from {from} to {to}")]
    InvalidTransition { from: LockState, to: LockState },

    /// Lookup failure
    #[error("Not found: {0}")]
    NotFound(String),

    /// Original failure with secondary errors attached
    #[error("{} (suppressed: {})", .error, .suppressed.iter().join("; "))]
    Suppressed {
        #[source]
        error: Box<Error>,
        suppressed: Vec<Error>,
    },
}

impl Error {
    /// Attach a secondary error without replacing this one.
    pub fn with_suppressed(self, other: Self) -> Self {
        match self {
            Self::Suppressed {
                error,
                mut suppressed,
            } => {
                suppressed.push(other);
                Self::Suppressed { error, suppressed }
            }
            error => Self::Suppressed {
                error: Box::new(error),
                suppressed: vec![other],
            },
        }
    }

    /// The original failure, looking through any suppressed wrapper.
    #[must_use]
    pub fn primary(&self) -> &Self {
        match self {
            Self::Suppressed { error, .. } => error.primary(),
            error => error,
        }
    }

    /// Secondary errors attached to this failure.
    #[must_use]
    pub fn suppressed(&self) -> &[Self] {
        match self {
            Self::Suppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Whether this is the "no release" sentinel.
    #[must_use]
    pub const fn is_no_release(&self) -> bool {
        matches!(self, Self::NoReleaseLock(_))
    }
}

/// Result type alias for lockstep-core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suppressed_keeps_primary() {
        let error = Error::Body("boom".into()).with_suppressed(Error::Pool("unlock".into()));

        assert!(matches!(error.primary(), Error::Body(msg) if msg == "boom"));
        assert_eq!(error.suppressed().len(), 1);
        assert!(error.to_string().contains("boom"));
        assert!(error.to_string().contains("unlock"));
    }

    #[test]
    fn test_with_suppressed_accumulates() {
        let error = Error::Body("boom".into())
            .with_suppressed(Error::Pool("first".into()))
            .with_suppressed(Error::Pool("second".into()));

        assert_eq!(error.suppressed().len(), 2);
        assert!(matches!(error.primary(), Error::Body(_)));
    }

    #[test]
    fn test_is_no_release() {
        assert!(Error::NoReleaseLock("handover".into()).is_no_release());
        assert!(!Error::Body("boom".into()).is_no_release());
    }

    #[test]
    fn test_plain_error_has_no_suppressed() {
        assert!(Error::Engine("gone".into()).suppressed().is_empty());
    }
}
