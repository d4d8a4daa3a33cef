//! Control-plane and switch-side data types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque port identifier shared by the control plane and the switch.
pub type PortId = String;

/// Network segment type as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// 802.1Q tagged segment (the only type backed by a DVS port group).
    Vlan,
    /// Untagged segment.
    Flat,
    /// VXLAN overlay.
    Vxlan,
    /// GRE overlay.
    Gre,
    /// Host-local segment.
    Local,
    /// Anything else.
    #[serde(untagged)]
    Other(String),
}

impl NetworkType {
    /// Returns the type name as used by the control plane.
    pub fn as_str(&self) -> &str {
        match self {
            NetworkType::Vlan => "vlan",
            NetworkType::Flat => "flat",
            NetworkType::Vxlan => "vxlan",
            NetworkType::Gre => "gre",
            NetworkType::Local => "local",
            NetworkType::Other(s) => s,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement of one network on the physical fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSegment {
    /// Segment type.
    pub network_type: NetworkType,
    /// Physical network name, required for VLAN segments.
    #[serde(default)]
    pub physical_network: Option<String>,
    /// VLAN id for VLAN segments.
    #[serde(default)]
    pub segmentation_id: Option<u16>,
}

impl NetworkSegment {
    /// Creates a VLAN segment.
    pub fn vlan(physical_network: impl Into<String>, segmentation_id: u16) -> Self {
        Self {
            network_type: NetworkType::Vlan,
            physical_network: Some(physical_network.into()),
            segmentation_id: Some(segmentation_id),
        }
    }
}

/// Network attributes passed to network lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network UUID.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Administrative state.
    #[serde(default = "default_admin_state_up")]
    pub admin_state_up: bool,
    /// `provider:physical_network` attribute.
    #[serde(default, rename = "provider:physical_network")]
    pub physical_network: Option<String>,
}

/// Port attributes passed to port lifecycle hooks and update notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port UUID.
    pub id: PortId,
    /// Owning network.
    #[serde(default)]
    pub network_id: String,
    /// Administrative state; absent in partial port records.
    #[serde(default)]
    pub admin_state_up: Option<bool>,
    /// Instance the port is plugged into.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Security groups applied to the port.
    #[serde(default)]
    pub security_groups: Vec<String>,
}

impl Port {
    /// Creates a port record with only an id and network.
    pub fn new(id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            admin_state_up: None,
            device_id: None,
            security_groups: Vec::new(),
        }
    }

    /// Sets the administrative state.
    pub fn with_admin_state_up(mut self, up: bool) -> Self {
        self.admin_state_up = Some(up);
        self
    }
}

fn default_admin_state_up() -> bool {
    true
}

/// A port as reported by the switch inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DvsPort {
    /// Switch-side port key.
    pub key: String,
    /// Port name; the agent names booked ports after the control-plane id.
    pub name: Option<String>,
    /// Key of the port group the port belongs to.
    pub portgroup_key: String,
    /// Whether a VM NIC is connected.
    pub active: bool,
}

/// Handle returned by a successful port booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBooking {
    /// Switch-side port key reserved for the port.
    pub port_key: String,
    /// Port group holding the reservation.
    pub portgroup_key: String,
    /// Name of the switch the port was booked on.
    pub dvs_name: String,
}
