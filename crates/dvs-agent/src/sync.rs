//! Reconciliation engine: full sync, orphan cleanup and incremental port
//! processing.

use std::collections::{BTreeMap, BTreeSet};

use dvs_agent_common::{DvsResult, PortId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::DvsAgent;
use crate::polling::PollingManager;

/// Port counts of one processing cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortStats {
    /// Ports that received new filters.
    pub added: usize,
    /// Ports whose filters were refreshed.
    pub updated: usize,
    /// Ports whose filters were removed.
    pub removed: usize,
}

/// A switch port that is not connected, with where it lives.
#[derive(Debug, Clone)]
struct Candidate {
    physical_network: String,
    portgroup_key: String,
}

impl DvsAgent {
    /// Returns the ids of the ports connected on any mapped switch.
    pub async fn get_dvs_ports(&self) -> DvsResult<BTreeSet<PortId>> {
        let mut ports = BTreeSet::new();
        for dvs in self.inner.network_map.backends() {
            debug!("Take port ids for dvs {}", dvs.name());
            let ids = self
                .inner
                .retry
                .run("get_port_ids", || dvs.get_port_ids())
                .await?;
            ports.extend(ids);
        }
        Ok(ports)
    }

    /// Full reconciliation pass. Every connected port not yet known is queued
    /// as added, then switch resources unknown to the control plane are
    /// removed. Returns the newly queued ports.
    ///
    /// The out-of-sync flag is cleared only on success.
    pub async fn full_sync(&self) -> DvsResult<BTreeSet<PortId>> {
        info!("Agent out of sync with plugin!");
        let connected = self.get_dvs_ports().await?;
        let added = self.inner.tracker.lock().apply_full_sync(&connected);
        self.clean_up_extra_resources(&connected).await?;
        self.full_sync_done();
        info!(
            connected = connected.len(),
            added = added.len(),
            "full sync completed"
        );
        Ok(added)
    }

    /// Releases switch ports the control plane does not recognize and
    /// deletes port groups left without active ports.
    ///
    /// A port that is not connected but still has a control-plane record
    /// (e.g. booked, VM not yet powered on) is kept, and so is its port group.
    pub async fn clean_up_extra_resources(&self, connected: &BTreeSet<PortId>) -> DvsResult<()> {
        debug!("Cleanup vsphere extra ports and networks...");
        let network_map = &self.inner.network_map;
        let retry = &self.inner.retry;

        let mut active_groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut candidates: BTreeMap<PortId, Candidate> = BTreeMap::new();

        for (physical_network, dvs) in network_map.iter() {
            let groups = active_groups.entry(physical_network.clone()).or_default();
            let ports = retry.run("get_ports", || dvs.get_ports(false)).await?;
            for port in ports {
                let Some(name) = port.name.filter(|n| !n.is_empty()) else {
                    continue;
                };
                if connected.contains(&name) {
                    groups.insert(port.portgroup_key);
                } else {
                    candidates.insert(
                        name,
                        Candidate {
                            physical_network: physical_network.clone(),
                            portgroup_key: port.portgroup_key,
                        },
                    );
                }
            }
        }

        if !candidates.is_empty() {
            let devices: Vec<PortId> = candidates.keys().cloned().collect();
            let details = self
                .inner
                .plugin_rpc
                .get_devices_details_list_and_failed_devices(
                    &devices,
                    &self.inner.agent_id,
                    &self.inner.config.agent.host,
                )
                .await?;
            let recognized = details.port_ids();

            for (port_id, candidate) in candidates {
                if recognized.contains(&port_id) {
                    active_groups
                        .entry(candidate.physical_network)
                        .or_default()
                        .insert(candidate.portgroup_key);
                    continue;
                }
                let Some(dvs) = network_map.get(&candidate.physical_network) else {
                    continue;
                };
                info!(port = %port_id, dvs = %dvs.name(), "releasing orphan port");
                retry
                    .run("release_port", || dvs.release_port(&port_id))
                    .await?;
            }
        }

        for (physical_network, dvs) in network_map.iter() {
            let groups = active_groups.remove(physical_network).unwrap_or_default();
            retry
                .run("delete_networks_without_active_ports", || {
                    dvs.delete_networks_without_active_ports(&groups)
                })
                .await?;
        }
        Ok(())
    }

    /// Returns true if this iteration has work: a required poll, a pending
    /// firewall refresh, or pending updates or deletions.
    pub fn has_updates(&self, polling: &PollingManager) -> bool {
        polling.is_polling_required()
            || self.inner.sg_agent.firewall_refresh_needed()
            || self.inner.tracker.lock().has_pending_changes()
    }

    /// Incremental processing: deletions first, then filter setup for the
    /// added and updated snapshots, then `known` absorbs the added ones.
    ///
    /// On failure the snapshots go back to the pending sets.
    pub async fn process_ports(&self) -> DvsResult<PortStats> {
        debug!("Process ports");
        let sg_agent = &self.inner.sg_agent;

        let deleted = self.inner.tracker.lock().take_deleted();
        if !deleted.is_empty() {
            if let Err(e) = sg_agent.remove_devices_filter(&deleted).await {
                warn!("Failed to remove filters for {:?}: {}", deleted, e);
                self.inner.tracker.lock().restore_deleted(deleted);
                return Err(e);
            }
        }

        let (added, updated) = {
            let mut tracker = self.inner.tracker.lock();
            (tracker.take_added(), tracker.take_updated())
        };
        if let Err(e) = sg_agent.setup_port_filters(&added, &updated).await {
            warn!("Failed to set up port filters: {}", e);
            self.inner.tracker.lock().abort_processing();
            return Err(e);
        }
        self.inner.tracker.lock().complete_processing();

        Ok(PortStats {
            added: added.len(),
            updated: updated.len(),
            removed: deleted.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::firewall::VCenterFirewallDriver;
    use crate::rpc::{DeviceDetail, DeviceDetails, MockPluginRpc};
    use crate::security_group::{DvsSecurityGroupRpc, LoopbackSecurityGroupServer};
    use dvs_agent_common::{MemoryDvs, NetworkMap};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn agent_with(dvs: Arc<MemoryDvs>, rpc: MockPluginRpc) -> DvsAgent {
        let mut map = NetworkMap::new();
        map.insert("physnet1", dvs);
        let mut config = AgentConfig::default();
        config.agent.host = "compute-1".to_string();
        DvsAgent::new(
            Arc::new(config),
            map,
            Arc::new(rpc),
            Arc::new(DvsSecurityGroupRpc::new(
                Arc::new(VCenterFirewallDriver),
                Arc::new(LoopbackSecurityGroupServer),
            )),
        )
    }

    fn ids(list: &[&str]) -> BTreeSet<PortId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_cleanup_queries_only_disconnected_ports() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        dvs.add_port("p1", "dvportgroup-a", true);
        dvs.add_port("p2", "dvportgroup-a", false);
        dvs.add_port("p3", "dvportgroup-b", false);

        let mut rpc = MockPluginRpc::new();
        rpc.expect_get_devices_details_list_and_failed_devices()
            .withf(|devices, agent_id, host| {
                devices == ["p2".to_string(), "p3".to_string()]
                    && agent_id == "dvs-agent-compute-1"
                    && host == "compute-1"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(DeviceDetails {
                    devices: vec![DeviceDetail::unknown("p2")],
                    failed_devices: vec![DeviceDetail::known("p3")],
                })
            });

        let agent = agent_with(dvs.clone(), rpc);
        agent.clean_up_extra_resources(&ids(&["p1"])).await.unwrap();

        assert!(dvs.port("p1").is_some());
        assert!(dvs.port("p2").is_none());
        assert!(dvs.port("p3").is_some());
    }

    #[tokio::test]
    async fn test_cleanup_skips_rpc_without_candidates() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        dvs.add_port("p1", "dvportgroup-a", true);

        let mut rpc = MockPluginRpc::new();
        rpc.expect_get_devices_details_list_and_failed_devices()
            .times(0);

        let agent = agent_with(dvs.clone(), rpc);
        agent.clean_up_extra_resources(&ids(&["p1"])).await.unwrap();
        assert!(dvs.port("p1").is_some());
    }

    #[tokio::test]
    async fn test_full_sync_clears_flag_and_queues_added() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        dvs.add_port("p1", "dvportgroup-a", true);
        dvs.add_port("p2", "dvportgroup-a", true);

        let mut rpc = MockPluginRpc::new();
        rpc.expect_get_devices_details_list_and_failed_devices()
            .times(0);
        let agent = agent_with(dvs, rpc);
        agent.with_tracker(|t| {
            t.apply_full_sync(&ids(&["p2"]));
            t.take_added();
            t.complete_processing();
        });

        let added = agent.full_sync().await.unwrap();
        assert_eq!(added, ids(&["p1"]));
        assert_eq!(agent.tracker_snapshot().added(), &ids(&["p1"]));
        assert!(!agent.needs_full_sync());
    }

    #[tokio::test]
    async fn test_full_sync_failure_keeps_flag() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        dvs.inject_failure(dvs_agent_common::DvsError::backend("get_ports", "fault"));
        let agent = agent_with(dvs, MockPluginRpc::new());

        assert!(agent.full_sync().await.is_err());
        assert!(agent.needs_full_sync());
    }

    #[tokio::test]
    async fn test_process_ports_counts() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        let agent = agent_with(dvs, MockPluginRpc::new());
        agent.with_tracker(|t| {
            t.apply_full_sync(&ids(&["p1", "p2"]));
            t.take_added();
            t.complete_processing();
            t.apply_full_sync(&ids(&["p1", "p2", "p3"]));
            t.mark_updated("p2");
            t.mark_deleted("p1");
        });

        let stats = agent.process_ports().await.unwrap();
        assert_eq!(
            stats,
            PortStats {
                added: 1,
                updated: 1,
                removed: 1
            }
        );
        assert_eq!(agent.tracker_snapshot().known(), &ids(&["p2", "p3"]));
    }

    #[tokio::test]
    async fn test_has_updates_with_minimized_polling() {
        let dvs = Arc::new(MemoryDvs::new("dvs1"));
        let agent = agent_with(dvs, MockPluginRpc::new());
        let mut polling = PollingManager::new(true);
        polling.polling_completed();

        assert!(!agent.has_updates(&polling));
        agent.with_tracker(|t| t.mark_updated("p1"));
        assert!(agent.has_updates(&polling));
    }
}
