//! Control-plane RPC collaborators.
//!
//! The message-bus transport is out of scope; the agent talks to the plugin
//! through these traits. Loopback implementations back standalone mode.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dvs_agent_common::{DvsResult, PortId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Agent binary name reported to the control plane.
pub const AGENT_BINARY: &str = "neutron-dvs-agent";

/// Agent type reported to the control plane.
pub const AGENT_TYPE: &str = "DVS agent";

/// Topic reported for L2 agents.
pub const L2_AGENT_TOPIC: &str = "N/A";

/// One entry of a device details lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetail {
    /// Device id as queried.
    pub device: String,
    /// Control-plane port id, present when the port record exists.
    #[serde(default)]
    pub port_id: Option<PortId>,
}

impl DeviceDetail {
    /// A device the control plane recognizes.
    pub fn known(port_id: impl Into<String>) -> Self {
        let port_id = port_id.into();
        Self {
            device: port_id.clone(),
            port_id: Some(port_id),
        }
    }

    /// A device without a port record.
    pub fn unknown(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            port_id: None,
        }
    }
}

/// Result of a batched device details lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    /// Devices resolved successfully.
    #[serde(default)]
    pub devices: Vec<DeviceDetail>,
    /// Devices whose lookup failed on the server.
    #[serde(default)]
    pub failed_devices: Vec<DeviceDetail>,
}

impl DeviceDetails {
    /// Port ids recognized by the control plane, from both lists.
    pub fn port_ids(&self) -> BTreeSet<PortId> {
        self.devices
            .iter()
            .chain(self.failed_devices.iter())
            .filter_map(|d| d.port_id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

/// Plugin-side RPC used by the reconciliation engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginRpc: Send + Sync {
    /// Looks up `devices` in the control plane.
    async fn get_devices_details_list_and_failed_devices(
        &self,
        devices: &[PortId],
        agent_id: &str,
        host: &str,
    ) -> DvsResult<DeviceDetails>;
}

/// Agent configuration block inside a state report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigurations {
    /// Physical network to switch mapping.
    pub bridge_mappings: BTreeMap<String, String>,
    /// vCenter address.
    pub vsphere_hostname: String,
    /// Whether heartbeats are logged.
    pub log_agent_heartbeats: bool,
}

/// Periodic agent state report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateReport {
    /// Agent binary name.
    pub binary: String,
    /// Host the agent runs on.
    pub host: String,
    /// Agent topic.
    pub topic: String,
    /// Static configuration.
    pub configurations: AgentConfigurations,
    /// Agent type.
    pub agent_type: String,
    /// Set until the first successful report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flag: Option<bool>,
}

impl AgentStateReport {
    /// Creates the initial report, with `start_flag` set.
    pub fn new(host: impl Into<String>, configurations: AgentConfigurations) -> Self {
        Self {
            binary: AGENT_BINARY.to_string(),
            host: host.into(),
            topic: L2_AGENT_TOPIC.to_string(),
            configurations,
            agent_type: AGENT_TYPE.to_string(),
            start_flag: Some(true),
        }
    }
}

/// Control-plane view of the agent after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// The agent was considered alive.
    Alive,
    /// The agent had been considered dead and is now back.
    Revived,
}

/// State report RPC.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateRpc: Send + Sync {
    /// Sends one state report.
    async fn report_state(&self, state: &AgentStateReport) -> DvsResult<AgentStatus>;
}

/// Plugin RPC that recognizes every queried device.
///
/// Used in standalone mode, where no control plane exists, so orphan
/// cleanup never releases a port.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPluginRpc;

#[async_trait]
impl PluginRpc for LoopbackPluginRpc {
    async fn get_devices_details_list_and_failed_devices(
        &self,
        devices: &[PortId],
        _agent_id: &str,
        _host: &str,
    ) -> DvsResult<DeviceDetails> {
        Ok(DeviceDetails {
            devices: devices.iter().map(DeviceDetail::known).collect(),
            failed_devices: Vec::new(),
        })
    }
}

/// State RPC that accepts every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackStateRpc;

#[async_trait]
impl StateRpc for LoopbackStateRpc {
    async fn report_state(&self, state: &AgentStateReport) -> DvsResult<AgentStatus> {
        debug!(host = %state.host, start_flag = ?state.start_flag, "state report accepted");
        Ok(AgentStatus::Alive)
    }
}
