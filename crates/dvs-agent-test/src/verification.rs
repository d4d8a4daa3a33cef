//! Verification helpers for agent tests
//!
//! Assertions over the tracker and the in-memory switches that return a
//! descriptive error instead of panicking, so tests can `expect` them.

use std::collections::BTreeSet;

use thiserror::Error;

use dvs_agent::PortStateTracker;
use dvs_agent_common::{MemoryDvs, PortId};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected {set} = {expected:?}, got {actual:?}")]
    SetMismatch {
        set: &'static str,
        expected: BTreeSet<PortId>,
        actual: BTreeSet<PortId>,
    },

    #[error("Tracker sets overlap: {0:?}")]
    Inconsistent(PortStateTracker),

    #[error("Expected port '{port}' on switch '{dvs}'")]
    PortMissing { dvs: String, port: String },

    #[error("Port '{port}' unexpectedly present on switch '{dvs}'")]
    PortPresent { dvs: String, port: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Tracker verification helper
pub struct TrackerVerifier {
    tracker: PortStateTracker,
}

impl TrackerVerifier {
    /// Verifies a snapshot of the tracker.
    pub fn new(tracker: PortStateTracker) -> Self {
        Self { tracker }
    }

    fn compare(
        set: &'static str,
        actual: &BTreeSet<PortId>,
        expected: &[&str],
    ) -> VerifyResult<()> {
        let expected: BTreeSet<PortId> = expected.iter().map(|s| s.to_string()).collect();
        if *actual != expected {
            return Err(VerificationError::SetMismatch {
                set,
                expected,
                actual: actual.clone(),
            });
        }
        Ok(())
    }

    /// Verify the `known` set
    pub fn assert_known(&self, expected: &[&str]) -> VerifyResult<()> {
        Self::compare("known", self.tracker.known(), expected)
    }

    /// Verify the `added` set
    pub fn assert_added(&self, expected: &[&str]) -> VerifyResult<()> {
        Self::compare("added", self.tracker.added(), expected)
    }

    /// Verify the `updated` set
    pub fn assert_updated(&self, expected: &[&str]) -> VerifyResult<()> {
        Self::compare("updated", self.tracker.updated(), expected)
    }

    /// Verify the `deleted` set
    pub fn assert_deleted(&self, expected: &[&str]) -> VerifyResult<()> {
        Self::compare("deleted", self.tracker.deleted(), expected)
    }

    /// Verify the `booked` set
    pub fn assert_booked(&self, expected: &[&str]) -> VerifyResult<()> {
        Self::compare("booked", self.tracker.booked(), expected)
    }

    /// Verify that known, added and deleted are pairwise disjoint
    pub fn assert_consistent(&self) -> VerifyResult<()> {
        if !self.tracker.is_consistent() {
            return Err(VerificationError::Inconsistent(self.tracker.clone()));
        }
        Ok(())
    }
}

/// Switch verification helper
pub struct SwitchVerifier<'a> {
    dvs: &'a MemoryDvs,
}

impl<'a> SwitchVerifier<'a> {
    /// Create a new switch verifier
    pub fn new(dvs: &'a MemoryDvs) -> Self {
        Self { dvs }
    }

    /// Verify that a port named `port` exists
    pub fn assert_port_exists(&self, port: &str) -> VerifyResult<()> {
        use dvs_agent_common::DvsBackend;
        if self.dvs.port(port).is_none() {
            return Err(VerificationError::PortMissing {
                dvs: self.dvs.name().to_string(),
                port: port.to_string(),
            });
        }
        Ok(())
    }

    /// Verify that no port named `port` exists
    pub fn assert_port_absent(&self, port: &str) -> VerifyResult<()> {
        use dvs_agent_common::DvsBackend;
        if self.dvs.port(port).is_some() {
            return Err(VerificationError::PortPresent {
                dvs: self.dvs.name().to_string(),
                port: port.to_string(),
            });
        }
        Ok(())
    }
}
