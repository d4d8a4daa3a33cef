//! Integration test infrastructure for the DVS agent
//!
//! Provides:
//! - Recording fakes for the security-group agent and control-plane RPC
//! - Agent fixtures wired to in-memory switches
//! - Tracker and switch verification helpers

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
