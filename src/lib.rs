//! berth - a development environment orchestrator
//!
//! berth reads a compose-style document and brings its services up in
//! dependency order:
//!
//! - Service, network and volume registry
//! - Dependency resolution with cycle detection
//! - TCP readiness probing that gates dependents
//! - Per-service restart supervision with exponential backoff
//!
//! Containers are driven through the Docker CLI.

pub mod compose;
pub mod container;
pub mod error;
pub mod orchestrator;
pub mod service;

#[cfg(test)]
mod testing;

pub use error::{BerthError, ConfigError, Result};
