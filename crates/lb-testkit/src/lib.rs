//! Test infrastructure for the load balancer sync daemon
//!
//! Provides:
//! - Service, destination and connection fixtures
//! - A scripted control source standing in for the configuration authority
//! - A table wrapper that injects backend failures
//! - A peer transport that records and decodes sync frames

pub mod fakes;
pub mod fixtures;

pub use fakes::*;
pub use fixtures::*;
