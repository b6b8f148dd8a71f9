//! Core domain models and traits for the agent fleet
//!
//! This crate contains the fleet's domain types: agent instances and their
//! status machine, workflow definitions and executions, fleet events, the
//! configuration model and the clock abstraction used for heartbeat ages.
//! It has no async runtime dependency; the service layer lives in
//! `agent-fleet-runtime`.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod instance;
pub mod workflow;

pub use error::{Error, Result};
