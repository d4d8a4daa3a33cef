//! In-process model of one distributed virtual switch.
//!
//! `MemoryDvs` keeps port groups and ports in memory and implements
//! [`DvsBackend`] with the same observable semantics as the vSphere client:
//! booking creates an unconnected port named after the control-plane id,
//! release is idempotent, and only agent-created port groups are garbage
//! collected. It backs standalone mode and the test suites.
//!
//! Failures can be queued with [`MemoryDvs::inject_failure`] to exercise the
//! retry path.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::DvsBackend;
use crate::error::{DvsError, DvsResult};
use crate::types::{DvsPort, Network, NetworkSegment, Port, PortBooking};

/// A port group on the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortGroup {
    /// Switch-side key (`dvportgroup-N`).
    pub key: String,
    /// Control-plane network id the group was created for.
    pub network_id: String,
    /// Display name.
    pub name: String,
    /// VLAN id.
    pub vlan_id: Option<u16>,
    /// Whether the group forwards traffic.
    pub enabled: bool,
}

/// A switch port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPort {
    /// Switch-side key.
    pub key: String,
    /// Port name (control-plane id for booked ports).
    pub name: Option<String>,
    /// Owning port group.
    pub portgroup_key: String,
    /// Whether a VM NIC is connected.
    pub connected: bool,
    /// Whether the port is administratively blocked.
    pub blocked: bool,
}

/// A mutating call recorded by the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Port group created.
    CreateNetwork(String),
    /// Port group updated.
    UpdateNetwork(String),
    /// Port group deleted.
    DeleteNetwork(String),
    /// Port booked.
    BookPort(String),
    /// Port released (only recorded when a port was actually removed).
    ReleasePort(String),
    /// Port blocked state toggled.
    SwitchBlockedState(String, bool),
}

#[derive(Debug, Default)]
struct State {
    portgroups: BTreeMap<String, PortGroup>,
    ports: BTreeMap<String, SwitchPort>,
    next_key: u64,
    failures: VecDeque<DvsError>,
    mutations: Vec<Mutation>,
}

impl State {
    fn next_key(&mut self, prefix: &str) -> String {
        self.next_key += 1;
        format!("{}-{}", prefix, self.next_key)
    }

    fn take_failure(&mut self) -> DvsResult<()> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn group_for_network(&self, network_id: &str) -> Option<&PortGroup> {
        self.portgroups.values().find(|g| g.network_id == network_id)
    }
}

/// In-memory distributed virtual switch.
#[derive(Debug)]
pub struct MemoryDvs {
    name: String,
    state: Mutex<State>,
}

impl MemoryDvs {
    /// Creates an empty switch.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Queues an error returned by the next backend call.
    pub fn inject_failure(&self, err: DvsError) {
        self.state.lock().failures.push_back(err);
    }

    /// Adds a port outside of the agent's control (e.g. left behind by a
    /// previous run). Creates the port group key if needed.
    pub fn add_port(&self, name: &str, portgroup_key: &str, connected: bool) {
        let mut state = self.state.lock();
        let key = state.next_key("port");
        state.ports.insert(
            key.clone(),
            SwitchPort {
                key,
                name: Some(name.to_string()),
                portgroup_key: portgroup_key.to_string(),
                connected,
                blocked: false,
            },
        );
    }

    /// Marks the port named `name` as connected or disconnected, simulating a
    /// VM NIC attach or detach. Returns false if no such port exists.
    pub fn set_connected(&self, name: &str, connected: bool) -> bool {
        let mut state = self.state.lock();
        match state
            .ports
            .values_mut()
            .find(|p| p.name.as_deref() == Some(name))
        {
            Some(port) => {
                port.connected = connected;
                true
            }
            None => false,
        }
    }

    /// Returns the port named `name`.
    pub fn port(&self, name: &str) -> Option<SwitchPort> {
        self.state
            .lock()
            .ports
            .values()
            .find(|p| p.name.as_deref() == Some(name))
            .cloned()
    }

    /// Returns the port group created for `network_id`.
    pub fn portgroup_for(&self, network_id: &str) -> Option<PortGroup> {
        self.state.lock().group_for_network(network_id).cloned()
    }

    /// Returns the keys of all port groups.
    pub fn portgroup_keys(&self) -> BTreeSet<String> {
        self.state.lock().portgroups.keys().cloned().collect()
    }

    /// Returns every mutating call that changed switch state, in order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.clone()
    }

    /// Forgets recorded mutations.
    pub fn clear_mutations(&self) {
        self.state.lock().mutations.clear();
    }
}

#[async_trait]
impl DvsBackend for MemoryDvs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_network(&self, network: &Network, segment: &NetworkSegment) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        if state.group_for_network(&network.id).is_some() {
            debug!(dvs = %self.name, network = %network.id, "port group already exists");
            return Ok(());
        }
        let key = state.next_key("dvportgroup");
        state.portgroups.insert(
            key.clone(),
            PortGroup {
                key: key.clone(),
                network_id: network.id.clone(),
                name: network.name.clone().unwrap_or_else(|| network.id.clone()),
                vlan_id: segment.segmentation_id,
                enabled: network.admin_state_up,
            },
        );
        state.mutations.push(Mutation::CreateNetwork(network.id.clone()));
        info!(dvs = %self.name, network = %network.id, portgroup = %key, "created port group");
        Ok(())
    }

    async fn update_network(&self, current: &Network, original: &Network) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let key = match state.group_for_network(&current.id) {
            Some(group) => group.key.clone(),
            None => {
                return Err(DvsError::backend(
                    "update_network",
                    format!("no port group for network {}", current.id),
                ))
            }
        };
        if current.name == original.name && current.admin_state_up == original.admin_state_up {
            return Ok(());
        }
        if let Some(group) = state.portgroups.get_mut(&key) {
            group.name = current.name.clone().unwrap_or_else(|| current.id.clone());
            group.enabled = current.admin_state_up;
        }
        state.mutations.push(Mutation::UpdateNetwork(current.id.clone()));
        Ok(())
    }

    async fn delete_network(&self, network: &Network) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let key = match state.group_for_network(&network.id) {
            Some(group) => group.key.clone(),
            None => return Ok(()),
        };
        if state.ports.values().any(|p| p.portgroup_key == key) {
            return Err(DvsError::ResourceInUse { resource: key });
        }
        state.portgroups.remove(&key);
        state.mutations.push(Mutation::DeleteNetwork(network.id.clone()));
        Ok(())
    }

    async fn book_port(
        &self,
        network: &Network,
        port_id: &str,
        _segment: &NetworkSegment,
    ) -> DvsResult<PortBooking> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let portgroup_key = match state.group_for_network(&network.id) {
            Some(group) => group.key.clone(),
            None => {
                return Err(DvsError::backend(
                    "book_port",
                    format!("no port group for network {}", network.id),
                ))
            }
        };
        if let Some(existing) = state
            .ports
            .values()
            .find(|p| p.name.as_deref() == Some(port_id))
        {
            return Ok(PortBooking {
                port_key: existing.key.clone(),
                portgroup_key: existing.portgroup_key.clone(),
                dvs_name: self.name.clone(),
            });
        }
        let key = state.next_key("port");
        state.ports.insert(
            key.clone(),
            SwitchPort {
                key: key.clone(),
                name: Some(port_id.to_string()),
                portgroup_key: portgroup_key.clone(),
                connected: false,
                blocked: false,
            },
        );
        state.mutations.push(Mutation::BookPort(port_id.to_string()));
        Ok(PortBooking {
            port_key: key,
            portgroup_key,
            dvs_name: self.name.clone(),
        })
    }

    async fn release_port(&self, port_id: &str) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let before = state.ports.len();
        state
            .ports
            .retain(|_, p| p.name.as_deref() != Some(port_id));
        if state.ports.len() != before {
            state.mutations.push(Mutation::ReleasePort(port_id.to_string()));
            info!(dvs = %self.name, port = %port_id, "released port");
        }
        Ok(())
    }

    async fn switch_port_blocked_state(&self, port: &Port) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let blocked = !port.admin_state_up.unwrap_or(true);
        match state
            .ports
            .values_mut()
            .find(|p| p.name.as_deref() == Some(port.id.as_str()))
        {
            Some(switch_port) => {
                switch_port.blocked = blocked;
            }
            None => {
                return Err(DvsError::backend(
                    "switch_port_blocked_state",
                    format!("port {} not found", port.id),
                ))
            }
        }
        state
            .mutations
            .push(Mutation::SwitchBlockedState(port.id.clone(), blocked));
        Ok(())
    }

    async fn get_ports(&self, active_only: bool) -> DvsResult<Vec<DvsPort>> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state
            .ports
            .values()
            .filter(|p| !active_only || p.connected)
            .map(|p| DvsPort {
                key: p.key.clone(),
                name: p.name.clone(),
                portgroup_key: p.portgroup_key.clone(),
                active: p.connected,
            })
            .collect())
    }

    async fn delete_networks_without_active_ports(
        &self,
        active_portgroups: &BTreeSet<String>,
    ) -> DvsResult<()> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let stale: Vec<PortGroup> = state
            .portgroups
            .values()
            .filter(|g| !active_portgroups.contains(&g.key))
            .cloned()
            .collect();
        for group in stale {
            // Ports still attached to a stale group go with it.
            state.ports.retain(|_, p| p.portgroup_key != group.key);
            state.portgroups.remove(&group.key);
            state
                .mutations
                .push(Mutation::DeleteNetwork(group.network_id.clone()));
            info!(
                dvs = %self.name,
                portgroup = %group.key,
                "deleted port group without active ports"
            );
        }
        Ok(())
    }
}
