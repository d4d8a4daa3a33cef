//! Error types for DVS agent operations.
//!
//! Domain errors (no backend for a physical network, unsupported segment
//! type, invalid network, invalid system state) are raised by the agent's own
//! lookups and are never retried. Transport and backend failures are
//! classified by [`DvsError::retry_delay`] so the retry policy can absorb
//! switch flakiness.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for DVS agent operations.
pub type DvsResult<T> = Result<T, DvsError>;

/// Errors that can occur while talking to the virtual switch or the control
/// plane.
#[derive(Debug, Clone, Error)]
pub enum DvsError {
    /// The physical network has no distributed switch mapped to it.
    #[error("No DVS is mapped for physical network '{physical_network}'")]
    NoDvsForPhysicalNetwork {
        /// The unmapped physical network.
        physical_network: String,
    },

    /// The segment uses a network type this agent does not manage.
    #[error("Network type '{network_type}' is not supported")]
    UnsupportedNetworkType {
        /// The rejected network type.
        network_type: String,
    },

    /// The network definition cannot be processed.
    #[error("Invalid network: {reason}")]
    InvalidNetwork {
        /// Why the network was rejected.
        reason: String,
    },

    /// The agent's view of the system is inconsistent with the request.
    #[error("Invalid system state: {details}")]
    InvalidSystemState {
        /// Description of the inconsistency.
        details: String,
    },

    /// The connection to the virtual switch was lost or refused.
    #[error("Connection to vSphere failed during {operation}: {message}")]
    Connection {
        /// The operation in flight.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Another client modified the same object concurrently.
    #[error("Concurrent modification during {operation}")]
    ConcurrentModification {
        /// The operation that lost the race.
        operation: String,
    },

    /// The object is temporarily held by another task on the switch.
    #[error("Resource '{resource}' is in use")]
    ResourceInUse {
        /// The busy resource.
        resource: String,
    },

    /// The switch rejected the operation.
    #[error("DVS operation failed: {operation}: {message}")]
    Backend {
        /// The operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// A control-plane RPC failed.
    #[error("RPC {method} failed: {message}")]
    Rpc {
        /// The remote method.
        method: String,
        /// Error message.
        message: String,
    },

    /// The firewall driver failed to apply a filter.
    #[error("Firewall error: {message}")]
    Firewall {
        /// Error message.
        message: String,
    },
}

impl DvsError {
    /// Creates a missing-mapping error.
    pub fn no_dvs(physical_network: impl Into<String>) -> Self {
        Self::NoDvsForPhysicalNetwork {
            physical_network: physical_network.into(),
        }
    }

    /// Creates an unsupported network type error.
    pub fn unsupported_network_type(network_type: impl Into<String>) -> Self {
        Self::UnsupportedNetworkType {
            network_type: network_type.into(),
        }
    }

    /// Creates an invalid network error.
    pub fn invalid_network(reason: impl Into<String>) -> Self {
        Self::InvalidNetwork {
            reason: reason.into(),
        }
    }

    /// Creates an invalid system state error.
    pub fn invalid_system_state(details: impl Into<String>) -> Self {
        Self::InvalidSystemState {
            details: details.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an RPC error.
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Returns the delay to wait before retrying, given the delay the policy
    /// would otherwise use.
    ///
    /// Returns `None` for errors that must not be retried. Concurrent
    /// modification conflicts are retried immediately.
    pub fn retry_delay(&self, policy_delay: Duration) -> Option<Duration> {
        match self {
            DvsError::ConcurrentModification { .. } => Some(Duration::ZERO),
            DvsError::Connection { .. } | DvsError::ResourceInUse { .. } => Some(policy_delay),
            _ => None,
        }
    }

    /// Returns true for errors raised while resolving a segment to a switch.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            DvsError::NoDvsForPhysicalNetwork { .. } | DvsError::UnsupportedNetworkType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DvsError::no_dvs("physnet1");
        assert_eq!(
            err.to_string(),
            "No DVS is mapped for physical network 'physnet1'"
        );

        let err = DvsError::unsupported_network_type("vxlan");
        assert_eq!(err.to_string(), "Network type 'vxlan' is not supported");
    }

    #[test]
    fn test_retry_delay() {
        let delay = Duration::from_millis(250);
        assert_eq!(
            DvsError::ConcurrentModification {
                operation: "x".to_string()
            }
            .retry_delay(delay),
            Some(Duration::ZERO)
        );
        assert_eq!(
            DvsError::connection("x", "y").retry_delay(delay),
            Some(delay)
        );
        assert_eq!(
            DvsError::ResourceInUse {
                resource: "dvportgroup-12".to_string()
            }
            .retry_delay(delay),
            Some(delay)
        );

        assert_eq!(DvsError::invalid_network("x").retry_delay(delay), None);
        assert_eq!(DvsError::no_dvs("physnet1").retry_delay(delay), None);
        assert_eq!(DvsError::invalid_system_state("bad").retry_delay(delay), None);
        assert_eq!(
            DvsError::backend("release_port", "fault").retry_delay(delay),
            None
        );
    }

    #[test]
    fn test_lookup_failure() {
        assert!(DvsError::no_dvs("p").is_lookup_failure());
        assert!(DvsError::unsupported_network_type("gre").is_lookup_failure());
        assert!(!DvsError::invalid_network("x").is_lookup_failure());
    }
}
