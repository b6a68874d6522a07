//! Commands module for the lockstep CLI

pub mod check;
pub mod run;
