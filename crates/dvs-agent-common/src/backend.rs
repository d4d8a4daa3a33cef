//! Backend gateway: the operations the agent needs from a distributed
//! virtual switch.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::DvsResult;
use crate::types::{DvsPort, Network, NetworkSegment, Port, PortBooking, PortId};

/// One distributed virtual switch.
///
/// Implementations wrap the vendor API client. Every method may fail with a
/// transient [`DvsError`](crate::DvsError); callers wrap them in a
/// [`RetryPolicy`](crate::RetryPolicy).
#[async_trait]
pub trait DvsBackend: Send + Sync {
    /// Returns the switch name (for logging).
    fn name(&self) -> &str;

    /// Creates the port group backing `network` on `segment`.
    async fn create_network(&self, network: &Network, segment: &NetworkSegment) -> DvsResult<()>;

    /// Applies attribute changes (name, admin state) to an existing port group.
    async fn update_network(&self, current: &Network, original: &Network) -> DvsResult<()>;

    /// Deletes the port group backing `network`.
    async fn delete_network(&self, network: &Network) -> DvsResult<()>;

    /// Reserves a switch port for `port_id` in the port group of `network`.
    async fn book_port(
        &self,
        network: &Network,
        port_id: &str,
        segment: &NetworkSegment,
    ) -> DvsResult<PortBooking>;

    /// Releases the switch port named after `port_id`.
    ///
    /// Releasing a port the switch does not know is not an error.
    async fn release_port(&self, port_id: &str) -> DvsResult<()>;

    /// Blocks or unblocks the switch port to match `port.admin_state_up`.
    async fn switch_port_blocked_state(&self, port: &Port) -> DvsResult<()>;

    /// Lists switch ports, optionally only those with a connected NIC.
    async fn get_ports(&self, active_only: bool) -> DvsResult<Vec<DvsPort>>;

    /// Deletes every agent-managed port group whose key is not in
    /// `active_portgroups`.
    async fn delete_networks_without_active_ports(
        &self,
        active_portgroups: &BTreeSet<String>,
    ) -> DvsResult<()>;

    /// Returns the ids of the ports currently connected on this switch.
    async fn get_port_ids(&self) -> DvsResult<BTreeSet<PortId>> {
        Ok(self
            .get_ports(true)
            .await?
            .into_iter()
            .filter_map(|p| p.name)
            .collect())
    }
}
