//! Test fixtures for agent scenarios
//!
//! Recording fakes stand in for the security-group agent and the control
//! plane; switches are [`MemoryDvs`] instances.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use dvs_agent::{
    AgentConfig, AgentDaemon, AgentStateReport, AgentStatus, DeviceDetail, DeviceDetails,
    DvsAgent, PluginRpc, SecurityGroupAgent, StateRpc,
};
use dvs_agent_common::{
    DvsBackend, DvsError, DvsResult, MemoryDvs, Network, NetworkMap, NetworkSegment, Port, PortId,
};

/// Builds a set of port ids.
pub fn port_ids(ids: &[&str]) -> BTreeSet<PortId> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// A call made to the security-group agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgCall {
    /// `setup_port_filters(new, updated)`.
    Setup {
        /// New devices.
        new: BTreeSet<PortId>,
        /// Updated devices.
        updated: BTreeSet<PortId>,
    },
    /// `remove_devices_filter(devices)`.
    Remove(BTreeSet<PortId>),
}

type RemoveHook = Box<dyn Fn() + Send + Sync>;

/// Security-group agent that records every call.
#[derive(Default)]
pub struct RecordingSecurityGroupAgent {
    calls: Mutex<Vec<SgCall>>,
    refresh_needed: Mutex<bool>,
    setup_failures: Mutex<VecDeque<DvsError>>,
    on_remove: Mutex<Option<RemoveHook>>,
}

impl std::fmt::Debug for RecordingSecurityGroupAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSecurityGroupAgent")
            .field("calls", &self.calls)
            .field("refresh_needed", &self.refresh_needed)
            .finish_non_exhaustive()
    }
}

impl RecordingSecurityGroupAgent {
    /// Creates an agent with no pending refresh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<SgCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Sets what `firewall_refresh_needed` returns until the next setup.
    pub fn set_refresh_needed(&self, needed: bool) {
        *self.refresh_needed.lock() = needed;
    }

    /// Makes the next `setup_port_filters` call fail with `err`.
    pub fn fail_next_setup(&self, err: DvsError) {
        self.setup_failures.lock().push_back(err);
    }

    /// Runs `hook` once, while the next `remove_devices_filter` call is in
    /// progress.
    pub fn on_next_remove(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_remove.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl SecurityGroupAgent for RecordingSecurityGroupAgent {
    async fn setup_port_filters(
        &self,
        new_devices: &BTreeSet<PortId>,
        updated_devices: &BTreeSet<PortId>,
    ) -> DvsResult<()> {
        self.calls.lock().push(SgCall::Setup {
            new: new_devices.clone(),
            updated: updated_devices.clone(),
        });
        if let Some(err) = self.setup_failures.lock().pop_front() {
            return Err(err);
        }
        *self.refresh_needed.lock() = false;
        Ok(())
    }

    async fn remove_devices_filter(&self, devices: &BTreeSet<PortId>) -> DvsResult<()> {
        self.calls.lock().push(SgCall::Remove(devices.clone()));
        let hook = self.on_remove.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn firewall_refresh_needed(&self) -> bool {
        *self.refresh_needed.lock()
    }

    fn security_groups_rule_updated(&self, _security_groups: &[String]) {
        *self.refresh_needed.lock() = true;
    }

    fn security_groups_member_updated(&self, _security_groups: &[String]) {
        *self.refresh_needed.lock() = true;
    }

    fn security_groups_provider_updated(&self, _devices_to_update: Option<&[PortId]>) {
        *self.refresh_needed.lock() = true;
    }
}

/// Plugin RPC recognizing a configurable set of ports.
#[derive(Debug, Default)]
pub struct FakePluginRpc {
    recognized: Mutex<BTreeSet<PortId>>,
    queries: Mutex<Vec<Vec<PortId>>>,
}

impl FakePluginRpc {
    /// Creates an RPC that recognizes `ids`.
    pub fn recognizing(ids: &[&str]) -> Self {
        Self {
            recognized: Mutex::new(port_ids(ids)),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Adds a recognized port.
    pub fn recognize(&self, port_id: &str) {
        self.recognized.lock().insert(port_id.to_string());
    }

    /// Device lists queried so far.
    pub fn queries(&self) -> Vec<Vec<PortId>> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl PluginRpc for FakePluginRpc {
    async fn get_devices_details_list_and_failed_devices(
        &self,
        devices: &[PortId],
        _agent_id: &str,
        _host: &str,
    ) -> DvsResult<DeviceDetails> {
        self.queries.lock().push(devices.to_vec());
        let recognized = self.recognized.lock();
        Ok(DeviceDetails {
            devices: devices
                .iter()
                .map(|id| {
                    if recognized.contains(id) {
                        DeviceDetail::known(id.clone())
                    } else {
                        DeviceDetail::unknown(id.clone())
                    }
                })
                .collect(),
            failed_devices: Vec::new(),
        })
    }
}

/// State RPC answering from a script; `Alive` once the script runs out.
#[derive(Debug, Default)]
pub struct FakeStateRpc {
    script: Mutex<VecDeque<DvsResult<AgentStatus>>>,
    reports: Mutex<Vec<AgentStateReport>>,
}

impl FakeStateRpc {
    /// Creates an RPC answering `script` in order.
    pub fn scripted(script: Vec<DvsResult<AgentStatus>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Reports received so far.
    pub fn reports(&self) -> Vec<AgentStateReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl StateRpc for FakeStateRpc {
    async fn report_state(&self, state: &AgentStateReport) -> DvsResult<AgentStatus> {
        self.reports.lock().push(state.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Ok(AgentStatus::Alive))
    }
}

/// A VLAN network on `physical_network`.
pub fn vlan_network(id: &str, physical_network: &str) -> Network {
    Network {
        id: id.to_string(),
        name: Some(format!("net-{}", id)),
        admin_state_up: true,
        physical_network: Some(physical_network.to_string()),
    }
}

/// A port with admin state up.
pub fn port(id: &str, network_id: &str) -> Port {
    Port::new(id, network_id).with_admin_state_up(true)
}

/// Configuration with short retry delays for tests.
pub fn test_config(host: &str, network_maps: &[&str]) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.host = host.to_string();
    config.agent.report_interval_secs = 0;
    config.ml2_vmware.network_maps = network_maps.iter().map(|s| s.to_string()).collect();
    config.retry.max_attempts = 3;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 1;
    config
}

/// An agent wired to in-memory switches and recording fakes.
pub struct AgentFixture {
    /// The agent under test.
    pub agent: DvsAgent,
    /// Switches by name.
    pub switches: BTreeMap<String, Arc<MemoryDvs>>,
    /// Security-group agent.
    pub sg: Arc<RecordingSecurityGroupAgent>,
    /// Control-plane RPC.
    pub plugin_rpc: Arc<FakePluginRpc>,
}

impl AgentFixture {
    /// Builds an agent for `physnet:dvs` mappings, with a control plane
    /// recognizing `recognized`.
    pub fn new(network_maps: &[&str], recognized: &[&str]) -> Self {
        Self::with_config(test_config("compute-1", network_maps), recognized)
    }

    /// Builds an agent from an explicit configuration.
    pub fn with_config(config: AgentConfig, recognized: &[&str]) -> Self {
        let mut switches = BTreeMap::new();
        let mappings = config
            .bridge_mappings()
            .unwrap_or_else(|e| panic!("invalid test mappings: {}", e));
        let network_map = NetworkMap::from_mappings(&mappings, |name| {
            let dvs = Arc::new(MemoryDvs::new(name));
            switches.insert(name.to_string(), Arc::clone(&dvs));
            Ok(dvs as Arc<dyn DvsBackend>)
        })
        .unwrap_or_else(|e| panic!("building network map: {}", e));

        let sg = Arc::new(RecordingSecurityGroupAgent::new());
        let plugin_rpc = Arc::new(FakePluginRpc::recognizing(recognized));
        let agent = DvsAgent::new(
            Arc::new(config),
            network_map,
            Arc::clone(&plugin_rpc) as Arc<dyn PluginRpc>,
            Arc::clone(&sg) as Arc<dyn SecurityGroupAgent>,
        );
        Self {
            agent,
            switches,
            sg,
            plugin_rpc,
        }
    }

    /// The switch named `name`.
    pub fn dvs(&self, name: &str) -> &Arc<MemoryDvs> {
        self.switches
            .get(name)
            .unwrap_or_else(|| panic!("no switch named {}", name))
    }

    /// A daemon loop over the agent.
    pub fn daemon(&self) -> AgentDaemon {
        AgentDaemon::new(self.agent.clone())
    }

    /// Creates `network` on its switch through the agent hooks.
    pub async fn create_network(&self, network: &Network, segment: &NetworkSegment) {
        use dvs_agent::DvsRpcHandler;
        self.agent
            .create_network_precommit(network, segment)
            .await
            .unwrap_or_else(|e| panic!("create_network_precommit failed: {}", e));
    }

    /// Marks every port in `ids` as known, as after a completed cycle.
    pub fn seed_known(&self, ids: &[&str]) {
        self.agent.with_tracker(|t| {
            t.apply_full_sync(&port_ids(ids));
            t.take_added();
            t.complete_processing();
        });
    }
}
