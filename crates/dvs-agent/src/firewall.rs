//! Firewall driver interface.
//!
//! vCenter enforces security group rules itself, so the shipped driver is a
//! no-op. The trait exists so the security-group agent can drive any
//! enforcement point the same way.

use std::collections::{BTreeMap, BTreeSet};

use dvs_agent_common::{DvsResult, PortId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Filter data for one port, as returned by the security-group server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortFilter {
    /// Port id.
    pub device: PortId,
    /// Security groups bound to the port.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Remote groups referenced by the port's rules.
    #[serde(default)]
    pub security_group_source_groups: Vec<String>,
    /// Opaque rule payload.
    #[serde(default)]
    pub security_group_rules: Vec<Value>,
}

impl PortFilter {
    /// Creates filter data for `device` with the given groups.
    pub fn new<I, S>(device: impl Into<String>, security_groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device: device.into(),
            security_groups: security_groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Enforcement point for port filters.
pub trait FirewallDriver: Send + Sync {
    /// Prepares filtering for a new port.
    fn prepare_port_filter(&self, port: &PortFilter) -> DvsResult<()>;

    /// Re-applies the filter of an existing port.
    fn update_port_filter(&self, port: &PortFilter) -> DvsResult<()>;

    /// Removes the filter of a port.
    fn remove_port_filter(&self, port_id: &str) -> DvsResult<()>;

    /// Starts batching filter changes.
    fn filter_defer_apply_on(&self);

    /// Applies batched filter changes.
    fn filter_defer_apply_off(&self) -> DvsResult<()>;

    /// Ports currently filtered by the driver.
    fn ports(&self) -> BTreeMap<PortId, PortFilter>;

    /// Rules (`sg_rule`) or members (`sg_member`) of `sec_group_ids`
    /// changed.
    fn security_group_updated(
        &self,
        action_type: &str,
        sec_group_ids: &BTreeSet<String>,
        device_id: Option<&str>,
    );
}

/// Driver for vCenter-enforced security groups. Every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct VCenterFirewallDriver;

impl FirewallDriver for VCenterFirewallDriver {
    fn prepare_port_filter(&self, port: &PortFilter) -> DvsResult<()> {
        trace!(port = %port.device, "prepare_port_filter");
        Ok(())
    }

    fn update_port_filter(&self, port: &PortFilter) -> DvsResult<()> {
        trace!(port = %port.device, "update_port_filter");
        Ok(())
    }

    fn remove_port_filter(&self, port_id: &str) -> DvsResult<()> {
        trace!(port = %port_id, "remove_port_filter");
        Ok(())
    }

    fn filter_defer_apply_on(&self) {}

    fn filter_defer_apply_off(&self) -> DvsResult<()> {
        Ok(())
    }

    fn ports(&self) -> BTreeMap<PortId, PortFilter> {
        BTreeMap::new()
    }

    fn security_group_updated(
        &self,
        action_type: &str,
        sec_group_ids: &BTreeSet<String>,
        _device_id: Option<&str>,
    ) {
        trace!(action_type, ?sec_group_ids, "security_group_updated");
    }
}
