//! Lockstep - run lock-guarded pipelines against a shared resource pool
//!
//! Reads a TOML file declaring resources and pipelines, then runs every
//! pipeline's command inside a lock step from `lockstep-core`.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};
