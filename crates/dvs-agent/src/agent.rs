//! The DVS agent: shared state, lifecycle hooks and event ingestion.
//!
//! [`DvsAgent`] is a cheap handle over the shared agent state. The daemon
//! loop, the heartbeat task and the notification pump each hold a clone.
//!
//! The agent exposes two capabilities by delegation:
//!
//! - [`DvsRpcHandler`]: network and port lifecycle hooks called by the
//!   mechanism driver. Switch calls run under the configured retry policy.
//! - [`SecurityGroupCallbacks`]: security-group notifications, forwarded to
//!   the security-group agent which defers the firewall refresh.
//!
//! Event ingestion (`port_update`, `port_delete`) only mutates the pending
//! sets of the [`PortStateTracker`]; it never calls the switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dvs_agent_common::{
    DvsBackend, DvsError, DvsResult, Network, NetworkMap, NetworkSegment, Port, PortBooking,
    PortId, RetryPolicy,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::config::AgentConfig;
use crate::rpc::PluginRpc;
use crate::security_group::SecurityGroupAgent;
use crate::tracker::PortStateTracker;

/// Network and port lifecycle hooks.
#[async_trait]
pub trait DvsRpcHandler: Send + Sync {
    /// Creates the port group for a new network.
    async fn create_network_precommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
    ) -> DvsResult<()>;

    /// Applies network attribute changes.
    async fn update_network_precommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
        original: &Network,
    ) -> DvsResult<()>;

    /// Deletes the port group of a removed network.
    async fn delete_network_postcommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
    ) -> DvsResult<()>;

    /// Reserves a switch port ahead of VM placement. Returns `None` when no
    /// segment matches the network's physical network.
    async fn book_port(
        &self,
        current: &Port,
        network_segments: &[NetworkSegment],
        network_current: &Network,
    ) -> DvsResult<Option<PortBooking>>;

    /// Confirms a booking and applies admin state changes.
    async fn update_port_postcommit(
        &self,
        current: &Port,
        original: &Port,
        segment: &NetworkSegment,
    ) -> DvsResult<()>;

    /// Releases the switch port of a deleted port.
    async fn delete_port_postcommit(
        &self,
        current: &Port,
        original: &Port,
        segment: &NetworkSegment,
    ) -> DvsResult<()>;
}

/// Security-group notification handler.
pub trait SecurityGroupCallbacks {
    /// Rules of `security_groups` changed.
    fn security_groups_rule_updated(&self, security_groups: &[String]);

    /// Members of `security_groups` changed.
    fn security_groups_member_updated(&self, security_groups: &[String]);

    /// Provider rules changed; `None` means every device.
    fn security_groups_provider_updated(&self, devices_to_update: Option<&[PortId]>);
}

pub(crate) struct AgentInner {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) agent_id: String,
    pub(crate) network_map: NetworkMap,
    pub(crate) retry: RetryPolicy,
    pub(crate) tracker: Mutex<PortStateTracker>,
    pub(crate) plugin_rpc: Arc<dyn PluginRpc>,
    pub(crate) sg_agent: Arc<dyn SecurityGroupAgent>,
    fullsync: AtomicBool,
    run_daemon_loop: AtomicBool,
}

/// Handle to the agent state.
#[derive(Clone)]
pub struct DvsAgent {
    pub(crate) inner: Arc<AgentInner>,
}

impl std::fmt::Debug for DvsAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DvsAgent")
            .field("agent_id", &self.inner.agent_id)
            .field("network_map", &self.inner.network_map)
            .field("fullsync", &self.needs_full_sync())
            .finish()
    }
}

impl DvsAgent {
    /// Creates an agent. The tracker starts empty and a full sync is
    /// pending.
    pub fn new(
        config: Arc<AgentConfig>,
        network_map: NetworkMap,
        plugin_rpc: Arc<dyn PluginRpc>,
        sg_agent: Arc<dyn SecurityGroupAgent>,
    ) -> Self {
        let agent_id = config.agent_id();
        let retry = config.retry_policy();
        Self {
            inner: Arc::new(AgentInner {
                config,
                agent_id,
                network_map,
                retry,
                tracker: Mutex::new(PortStateTracker::new()),
                plugin_rpc,
                sg_agent,
                fullsync: AtomicBool::new(true),
                run_daemon_loop: AtomicBool::new(true),
            }),
        }
    }

    /// Agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// `dvs-agent-<host>`.
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Physical network to switch mapping.
    pub fn network_map(&self) -> &NetworkMap {
        &self.inner.network_map
    }

    /// Security-group agent.
    pub fn sg_agent(&self) -> &Arc<dyn SecurityGroupAgent> {
        &self.inner.sg_agent
    }

    /// Returns a copy of the tracker.
    pub fn tracker_snapshot(&self) -> PortStateTracker {
        self.inner.tracker.lock().clone()
    }

    /// Runs `f` with exclusive access to the tracker.
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut PortStateTracker) -> R) -> R {
        f(&mut self.inner.tracker.lock())
    }

    /// Returns true if a full sync is pending.
    pub fn needs_full_sync(&self) -> bool {
        self.inner.fullsync.load(Ordering::SeqCst)
    }

    /// Schedules a full sync on the next loop iteration.
    pub fn request_full_sync(&self) {
        self.inner.fullsync.store(true, Ordering::SeqCst);
    }

    pub(crate) fn full_sync_done(&self) {
        self.inner.fullsync.store(false, Ordering::SeqCst);
    }

    /// Returns true until [`DvsAgent::stop`] is called.
    pub fn is_running(&self) -> bool {
        self.inner.run_daemon_loop.load(Ordering::SeqCst)
    }

    /// Asks the daemon loop to exit after the current iteration.
    pub fn stop(&self) {
        self.inner.run_daemon_loop.store(false, Ordering::SeqCst);
    }

    /// Port update notification.
    pub fn port_update(&self, port: &Port) {
        self.inner.tracker.lock().mark_updated(&port.id);
        debug!("port_update message processed for port {}", port.id);
    }

    /// Port delete notification.
    pub fn port_delete(&self, port_id: &str) {
        self.inner.tracker.lock().mark_deleted(port_id);
        debug!("port_delete message processed for port {}", port_id);
    }

    /// Network delete notification. Port groups are removed by the
    /// delete-postcommit hook and by orphan cleanup, so nothing is queued.
    pub fn network_delete(&self, network_id: &str) {
        debug!("network_delete message processed for network {}", network_id);
    }

    fn resolve_for_network(
        &self,
        action: &str,
        network: &Network,
        segment: &NetworkSegment,
    ) -> DvsResult<Option<Arc<dyn DvsBackend>>> {
        match self.inner.network_map.lookup(segment) {
            Ok(dvs) => Ok(Some(dvs)),
            Err(e) if e.is_lookup_failure() => {
                info!("Network {} not {}. Reason: {}", network.id, action, e);
                Ok(None)
            }
            Err(DvsError::InvalidNetwork { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn resolve_for_port(
        &self,
        action: &str,
        port: &Port,
        segment: &NetworkSegment,
    ) -> DvsResult<Option<Arc<dyn DvsBackend>>> {
        match self.inner.network_map.lookup(segment) {
            Ok(dvs) => Ok(Some(dvs)),
            Err(e @ DvsError::UnsupportedNetworkType { .. }) => {
                info!("Port {} not {}. Reason: {}", port.id, action, e);
                Ok(None)
            }
            Err(DvsError::NoDvsForPhysicalNetwork { .. }) => Err(no_mapping_for_port(&port.id)),
            Err(e) => Err(e),
        }
    }

    async fn update_admin_state_up(
        &self,
        dvs: &Arc<dyn DvsBackend>,
        original: &Port,
        current: &Port,
    ) -> DvsResult<()> {
        let Some(original_admin_state_up) = original.admin_state_up else {
            return Ok(());
        };
        match current.admin_state_up {
            Some(up) if up != original_admin_state_up => {
                self.inner
                    .retry
                    .run("switch_port_blocked_state", || {
                        dvs.switch_port_blocked_state(current)
                    })
                    .await
            }
            _ => Ok(()),
        }
    }
}

fn no_mapping_for_port(port_id: &str) -> DvsError {
    DvsError::invalid_system_state(format!(
        "Port {} belongs to a VMware VM, but there is no mapping from network to DVS.",
        port_id
    ))
}

#[async_trait]
impl DvsRpcHandler for DvsAgent {
    #[instrument(skip_all, fields(network = %current.id))]
    async fn create_network_precommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
    ) -> DvsResult<()> {
        let Some(dvs) = self.resolve_for_network("created", current, segment)? else {
            return Ok(());
        };
        self.inner
            .retry
            .run("create_network", || dvs.create_network(current, segment))
            .await
    }

    #[instrument(skip_all, fields(network = %current.id))]
    async fn update_network_precommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
        original: &Network,
    ) -> DvsResult<()> {
        let Some(dvs) = self.resolve_for_network("updated", current, segment)? else {
            return Ok(());
        };
        self.inner
            .retry
            .run("update_network", || dvs.update_network(current, original))
            .await
    }

    #[instrument(skip_all, fields(network = %current.id))]
    async fn delete_network_postcommit(
        &self,
        current: &Network,
        segment: &NetworkSegment,
    ) -> DvsResult<()> {
        let Some(dvs) = self.resolve_for_network("deleted", current, segment)? else {
            return Ok(());
        };
        self.inner
            .retry
            .run("delete_network", || dvs.delete_network(current))
            .await
    }

    #[instrument(skip_all, fields(port = %current.id))]
    async fn book_port(
        &self,
        current: &Port,
        network_segments: &[NetworkSegment],
        network_current: &Network,
    ) -> DvsResult<Option<PortBooking>> {
        let Some(segment) = network_segments
            .iter()
            .rev()
            .find(|s| s.physical_network == network_current.physical_network)
        else {
            return Ok(None);
        };
        let Some(dvs) = self.resolve_for_port("booked", current, segment)? else {
            return Ok(None);
        };
        let booking = self
            .inner
            .retry
            .run("book_port", || {
                dvs.book_port(network_current, &current.id, segment)
            })
            .await?;
        self.inner.tracker.lock().book(&current.id);
        info!(dvs = %booking.dvs_name, port_key = %booking.port_key, "port booked");
        Ok(Some(booking))
    }

    #[instrument(skip_all, fields(port = %current.id))]
    async fn update_port_postcommit(
        &self,
        current: &Port,
        original: &Port,
        segment: &NetworkSegment,
    ) -> DvsResult<()> {
        let Some(dvs) = self.resolve_for_port("updated", current, segment)? else {
            return Ok(());
        };
        self.inner.tracker.lock().promote_booked(&current.id);
        // Security groups are refreshed by the loop via firewall_refresh_needed.
        self.update_admin_state_up(&dvs, original, current).await
    }

    #[instrument(skip_all, fields(port = %current.id))]
    async fn delete_port_postcommit(
        &self,
        current: &Port,
        _original: &Port,
        segment: &NetworkSegment,
    ) -> DvsResult<()> {
        let Some(dvs) = self.resolve_for_port("deleted", current, segment)? else {
            return Ok(());
        };
        self.inner
            .retry
            .run("release_port", || dvs.release_port(&current.id))
            .await
    }
}

impl SecurityGroupCallbacks for DvsAgent {
    fn security_groups_rule_updated(&self, security_groups: &[String]) {
        self.inner.sg_agent.security_groups_rule_updated(security_groups);
    }

    fn security_groups_member_updated(&self, security_groups: &[String]) {
        self.inner.sg_agent.security_groups_member_updated(security_groups);
    }

    fn security_groups_provider_updated(&self, devices_to_update: Option<&[PortId]>) {
        self.inner
            .sg_agent
            .security_groups_provider_updated(devices_to_update);
    }
}
