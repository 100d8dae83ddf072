//! Validation engine for disaster-recovery operations on replicated VM pairs.
//!
//! The controller builds one pair per source VM, checks and seeds each pair,
//! triggers the DR job, and validates the job's phase trace and the pairs'
//! resulting state against an authored catalog of expected phases.

pub mod backend;
pub mod catalog;
pub mod cli;
pub mod clone;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod journal;
pub mod model;
pub mod pairs;
pub mod preflight;
pub mod replay;
pub mod reporter;
pub mod settle;
pub mod strategy;
pub mod tracer;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{Controller, DrillReport};
pub use error::{DrError, Result};
