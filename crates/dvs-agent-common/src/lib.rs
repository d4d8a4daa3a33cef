//! Common abstractions for the DVS agent.
//!
//! This crate provides the types shared by the agent daemon and its test
//! support crate:
//!
//! - [`DvsBackend`]: Gateway trait for one distributed virtual switch
//! - [`NetworkMap`]: Read-only physical network to switch mapping
//! - [`RetryPolicy`]: Bounded retry for transient switch failures
//! - [`DvsError`]: Error taxonomy shared by hooks and the sync loop
//! - [`MemoryDvs`]: In-process switch used in standalone mode and tests
//!
//! # Architecture
//!
//! 1. The control plane calls network and port lifecycle hooks
//! 2. Hooks resolve the segment to a switch through the [`NetworkMap`]
//! 3. Switch calls run under a [`RetryPolicy`]
//! 4. The agent loop reconciles the switch inventory against its port view
//!
//! # Example
//!
//! ```ignore
//! use dvs_agent_common::{NetworkMap, NetworkSegment, RetryPolicy};
//!
//! let dvs = network_map.lookup(&NetworkSegment::vlan("physnet1", 100))?;
//! RetryPolicy::default()
//!     .run("release_port", || dvs.release_port(&port_id))
//!     .await?;
//! ```

mod backend;
mod error;
mod memory;
mod network_map;
mod retry;
mod types;

pub use backend::DvsBackend;
pub use error::{DvsError, DvsResult};
pub use memory::{MemoryDvs, Mutation, PortGroup, SwitchPort};
pub use network_map::{parse_mappings, MappingError, NetworkMap};
pub use retry::{Backoff, RetryPolicy};
pub use types::{DvsPort, Network, NetworkSegment, NetworkType, Port, PortBooking, PortId};
