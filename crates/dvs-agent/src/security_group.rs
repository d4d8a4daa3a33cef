//! Security-group agent with deferred firewall refresh.
//!
//! Security-group notifications never touch the firewall directly. They
//! queue the affected devices (or a global refresh), and the next
//! reconciliation cycle picks them up through
//! [`SecurityGroupAgent::setup_port_filters`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dvs_agent_common::{DvsResult, PortId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::firewall::{FirewallDriver, PortFilter};

/// Server side of security-group RPC.
#[async_trait]
pub trait SecurityGroupServerRpc: Send + Sync {
    /// Returns filter data for `devices`. Unknown devices are omitted.
    async fn security_group_info_for_devices(
        &self,
        devices: &BTreeSet<PortId>,
    ) -> DvsResult<BTreeMap<PortId, PortFilter>>;
}

/// Security-group server stand-in that returns empty filters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackSecurityGroupServer;

#[async_trait]
impl SecurityGroupServerRpc for LoopbackSecurityGroupServer {
    async fn security_group_info_for_devices(
        &self,
        devices: &BTreeSet<PortId>,
    ) -> DvsResult<BTreeMap<PortId, PortFilter>> {
        Ok(devices
            .iter()
            .map(|id| (id.clone(), PortFilter::new(id.clone(), Vec::<String>::new())))
            .collect())
    }
}

/// Firewall side of the reconciliation engine.
#[async_trait]
pub trait SecurityGroupAgent: Send + Sync {
    /// Installs filters for `new_devices` and refreshes `updated_devices`.
    async fn setup_port_filters(
        &self,
        new_devices: &BTreeSet<PortId>,
        updated_devices: &BTreeSet<PortId>,
    ) -> DvsResult<()>;

    /// Removes the filters of `devices`.
    async fn remove_devices_filter(&self, devices: &BTreeSet<PortId>) -> DvsResult<()>;

    /// Returns true if deferred refresh work is queued.
    fn firewall_refresh_needed(&self) -> bool;

    /// Rules of `security_groups` changed.
    fn security_groups_rule_updated(&self, security_groups: &[String]);

    /// Members of `security_groups` changed.
    fn security_groups_member_updated(&self, security_groups: &[String]);

    /// Provider rules changed; `None` means every device.
    fn security_groups_provider_updated(&self, devices_to_update: Option<&[PortId]>);
}

#[derive(Debug, Default)]
struct RefreshState {
    devices_to_refilter: BTreeSet<PortId>,
    global_refresh_firewall: bool,
}

/// Security-group agent over a [`FirewallDriver`].
pub struct DvsSecurityGroupRpc {
    firewall: Arc<dyn FirewallDriver>,
    server: Arc<dyn SecurityGroupServerRpc>,
    refresh: Mutex<RefreshState>,
}

impl DvsSecurityGroupRpc {
    /// Creates an agent with deferred refresh.
    pub fn new(firewall: Arc<dyn FirewallDriver>, server: Arc<dyn SecurityGroupServerRpc>) -> Self {
        Self {
            firewall,
            server,
            refresh: Mutex::new(RefreshState::default()),
        }
    }

    /// Devices queued for refilter.
    pub fn devices_to_refilter(&self) -> BTreeSet<PortId> {
        self.refresh.lock().devices_to_refilter.clone()
    }

    async fn prepare_devices_filter(&self, devices: &BTreeSet<PortId>) -> DvsResult<()> {
        info!("Preparing filters for devices {:?}", devices);
        let filters = self.server.security_group_info_for_devices(devices).await?;
        self.firewall.filter_defer_apply_on();
        for filter in filters.values() {
            self.firewall.prepare_port_filter(filter)?;
        }
        self.firewall.filter_defer_apply_off()
    }

    async fn refresh_firewall(&self, devices: &BTreeSet<PortId>) -> DvsResult<()> {
        info!("Refresh firewall rules");
        let filters = self.server.security_group_info_for_devices(devices).await?;
        self.firewall.filter_defer_apply_on();
        for filter in filters.values() {
            debug!(port = %filter.device, "Update port filter");
            self.firewall.update_port_filter(filter)?;
        }
        self.firewall.filter_defer_apply_off()
    }

    async fn apply_filters(
        &self,
        new_devices: &BTreeSet<PortId>,
        updated: &BTreeSet<PortId>,
    ) -> DvsResult<()> {
        if !new_devices.is_empty() {
            self.prepare_devices_filter(new_devices).await?;
        }
        if !updated.is_empty() {
            self.refresh_firewall(updated).await?;
        }
        Ok(())
    }

    fn security_group_updated(&self, security_groups: &[String], attribute: Attribute) {
        let sec_group_ids: BTreeSet<String> = security_groups.iter().cloned().collect();
        self.firewall
            .security_group_updated(attribute.action_type(), &sec_group_ids, None);

        let groups: BTreeSet<&str> = security_groups.iter().map(String::as_str).collect();
        let devices: Vec<PortId> = self
            .firewall
            .ports()
            .into_values()
            .filter(|filter| {
                attribute
                    .of(filter)
                    .iter()
                    .any(|sg| groups.contains(sg.as_str()))
            })
            .map(|filter| filter.device)
            .collect();
        if !devices.is_empty() {
            info!("Security group {:?} updated for devices {:?}", attribute, devices);
            self.refresh.lock().devices_to_refilter.extend(devices);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Attribute {
    SecurityGroups,
    SourceGroups,
}

impl Attribute {
    fn of(self, filter: &PortFilter) -> &[String] {
        match self {
            Attribute::SecurityGroups => &filter.security_groups,
            Attribute::SourceGroups => &filter.security_group_source_groups,
        }
    }

    fn action_type(self) -> &'static str {
        match self {
            Attribute::SecurityGroups => "sg_rule",
            Attribute::SourceGroups => "sg_member",
        }
    }
}

#[async_trait]
impl SecurityGroupAgent for DvsSecurityGroupRpc {
    async fn setup_port_filters(
        &self,
        new_devices: &BTreeSet<PortId>,
        updated_devices: &BTreeSet<PortId>,
    ) -> DvsResult<()> {
        let (devices_to_refilter, global_refresh) = {
            let mut refresh = self.refresh.lock();
            (
                std::mem::take(&mut refresh.devices_to_refilter),
                std::mem::replace(&mut refresh.global_refresh_firewall, false),
            )
        };

        let mut updated: BTreeSet<PortId> = updated_devices | &devices_to_refilter;
        if global_refresh {
            updated.extend(self.firewall.ports().into_keys());
        }
        let updated: BTreeSet<PortId> = updated.difference(new_devices).cloned().collect();

        let result = self.apply_filters(new_devices, &updated).await;
        if result.is_err() {
            // Queued refresh work survives a failed cycle.
            let mut refresh = self.refresh.lock();
            refresh.devices_to_refilter.extend(devices_to_refilter);
            refresh.global_refresh_firewall |= global_refresh;
        }
        result
    }

    async fn remove_devices_filter(&self, devices: &BTreeSet<PortId>) -> DvsResult<()> {
        info!("Remove device filter for {:?}", devices);
        self.firewall.filter_defer_apply_on();
        for device in devices {
            self.firewall.remove_port_filter(device)?;
        }
        self.firewall.filter_defer_apply_off()
    }

    fn firewall_refresh_needed(&self) -> bool {
        let refresh = self.refresh.lock();
        refresh.global_refresh_firewall || !refresh.devices_to_refilter.is_empty()
    }

    fn security_groups_rule_updated(&self, security_groups: &[String]) {
        info!("Security group rule updated {:?}", security_groups);
        self.security_group_updated(security_groups, Attribute::SecurityGroups);
    }

    fn security_groups_member_updated(&self, security_groups: &[String]) {
        info!("Security group member updated {:?}", security_groups);
        self.security_group_updated(security_groups, Attribute::SourceGroups);
    }

    fn security_groups_provider_updated(&self, devices_to_update: Option<&[PortId]>) {
        info!("Provider rule updated");
        let mut refresh = self.refresh.lock();
        match devices_to_update {
            None => refresh.global_refresh_firewall = true,
            Some(devices) => refresh.devices_to_refilter.extend(devices.iter().cloned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::VCenterFirewallDriver;
    use dvs_agent_common::DvsError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ids(list: &[&str]) -> BTreeSet<PortId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Default)]
    struct RecordingFirewall {
        filtered: Mutex<BTreeMap<PortId, PortFilter>>,
        calls: Mutex<Vec<String>>,
        group_updates: Mutex<Vec<(String, BTreeSet<String>)>>,
    }

    impl FirewallDriver for RecordingFirewall {
        fn prepare_port_filter(&self, port: &PortFilter) -> DvsResult<()> {
            self.calls.lock().push(format!("prepare:{}", port.device));
            self.filtered.lock().insert(port.device.clone(), port.clone());
            Ok(())
        }
        fn update_port_filter(&self, port: &PortFilter) -> DvsResult<()> {
            self.calls.lock().push(format!("update:{}", port.device));
            Ok(())
        }
        fn remove_port_filter(&self, port_id: &str) -> DvsResult<()> {
            self.calls.lock().push(format!("remove:{}", port_id));
            self.filtered.lock().remove(port_id);
            Ok(())
        }
        fn filter_defer_apply_on(&self) {}
        fn filter_defer_apply_off(&self) -> DvsResult<()> {
            Ok(())
        }
        fn ports(&self) -> BTreeMap<PortId, PortFilter> {
            self.filtered.lock().clone()
        }
        fn security_group_updated(
            &self,
            action_type: &str,
            sec_group_ids: &BTreeSet<String>,
            _device_id: Option<&str>,
        ) {
            self.group_updates
                .lock()
                .push((action_type.to_string(), sec_group_ids.clone()));
        }
    }

    struct GroupServer;

    #[async_trait]
    impl SecurityGroupServerRpc for GroupServer {
        async fn security_group_info_for_devices(
            &self,
            devices: &BTreeSet<PortId>,
        ) -> DvsResult<BTreeMap<PortId, PortFilter>> {
            Ok(devices
                .iter()
                .map(|id| {
                    let mut filter = PortFilter::new(id.clone(), [format!("sg-{}", id)]);
                    filter.security_group_source_groups = vec!["sg-remote".to_string()];
                    (id.clone(), filter)
                })
                .collect())
        }
    }

    /// Fails the first `failures` lookups, then answers like [`GroupServer`].
    struct FlakyServer {
        failures: AtomicU32,
    }

    #[async_trait]
    impl SecurityGroupServerRpc for FlakyServer {
        async fn security_group_info_for_devices(
            &self,
            devices: &BTreeSet<PortId>,
        ) -> DvsResult<BTreeMap<PortId, PortFilter>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DvsError::rpc("security_group_info_for_devices", "timeout"));
            }
            GroupServer.security_group_info_for_devices(devices).await
        }
    }

    fn flaky_agent(failures: u32) -> (Arc<RecordingFirewall>, DvsSecurityGroupRpc) {
        let firewall = Arc::new(RecordingFirewall::default());
        let server = Arc::new(FlakyServer {
            failures: AtomicU32::new(failures),
        });
        let agent = DvsSecurityGroupRpc::new(firewall.clone(), server);
        (firewall, agent)
    }

    fn agent() -> (Arc<RecordingFirewall>, DvsSecurityGroupRpc) {
        let firewall = Arc::new(RecordingFirewall::default());
        let agent = DvsSecurityGroupRpc::new(firewall.clone(), Arc::new(GroupServer));
        (firewall, agent)
    }

    #[tokio::test]
    async fn test_setup_prepares_new_and_refreshes_updated() {
        let (firewall, agent) = agent();
        agent
            .setup_port_filters(&ids(&["p1"]), &ids(&["p1", "p2"]))
            .await
            .unwrap();
        assert_eq!(
            *firewall.calls.lock(),
            vec!["prepare:p1".to_string(), "update:p2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rule_update_is_deferred() {
        let (firewall, agent) = agent();
        agent.setup_port_filters(&ids(&["p1", "p2"]), &BTreeSet::new()).await.unwrap();
        firewall.calls.lock().clear();

        agent.security_groups_rule_updated(&["sg-p2".to_string()]);
        assert!(firewall.calls.lock().is_empty());
        assert!(agent.firewall_refresh_needed());
        assert_eq!(agent.devices_to_refilter(), ids(&["p2"]));

        agent.setup_port_filters(&BTreeSet::new(), &BTreeSet::new()).await.unwrap();
        assert_eq!(*firewall.calls.lock(), vec!["update:p2".to_string()]);
        assert!(!agent.firewall_refresh_needed());
    }

    #[tokio::test]
    async fn test_member_update_matches_source_groups() {
        let (_firewall, agent) = agent();
        agent.setup_port_filters(&ids(&["p1", "p2"]), &BTreeSet::new()).await.unwrap();

        agent.security_groups_member_updated(&["sg-remote".to_string()]);
        assert_eq!(agent.devices_to_refilter(), ids(&["p1", "p2"]));

        agent.security_groups_member_updated(&["sg-p1".to_string()]);
        assert_eq!(agent.devices_to_refilter(), ids(&["p1", "p2"]));
    }

    #[tokio::test]
    async fn test_provider_update_global_refresh() {
        let (firewall, agent) = agent();
        agent.setup_port_filters(&ids(&["p1"]), &BTreeSet::new()).await.unwrap();
        firewall.calls.lock().clear();

        agent.security_groups_provider_updated(None);
        assert!(agent.firewall_refresh_needed());

        agent.setup_port_filters(&ids(&["p3"]), &BTreeSet::new()).await.unwrap();
        assert_eq!(
            *firewall.calls.lock(),
            vec!["prepare:p3".to_string(), "update:p1".to_string()]
        );
        assert!(!agent.firewall_refresh_needed());
    }

    #[tokio::test]
    async fn test_remove_devices_filter() {
        let (firewall, agent) = agent();
        agent.setup_port_filters(&ids(&["p1"]), &BTreeSet::new()).await.unwrap();
        agent.remove_devices_filter(&ids(&["p1"])).await.unwrap();
        assert!(firewall.ports().is_empty());
    }

    #[tokio::test]
    async fn test_vcenter_driver_ignores_group_updates() {
        let agent = DvsSecurityGroupRpc::new(
            Arc::new(VCenterFirewallDriver),
            Arc::new(LoopbackSecurityGroupServer),
        );
        agent.setup_port_filters(&ids(&["p1"]), &BTreeSet::new()).await.unwrap();
        agent.security_groups_rule_updated(&["sg1".to_string()]);
        assert!(!agent.firewall_refresh_needed());

        agent.security_groups_provider_updated(Some(&["p1".to_string()]));
        assert!(agent.firewall_refresh_needed());
    }

    #[tokio::test]
    async fn test_rule_update_notifies_driver() {
        let (firewall, agent) = agent();
        agent.security_groups_rule_updated(&["sg1".to_string()]);
        agent.security_groups_member_updated(&["sg2".to_string()]);
        assert_eq!(
            *firewall.group_updates.lock(),
            vec![
                ("sg_rule".to_string(), BTreeSet::from(["sg1".to_string()])),
                ("sg_member".to_string(), BTreeSet::from(["sg2".to_string()])),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_prepare_keeps_queued_refresh() {
        let (firewall, agent) = flaky_agent(1);
        agent.security_groups_provider_updated(Some(&["p2".to_string()]));

        assert!(agent
            .setup_port_filters(&ids(&["p1"]), &BTreeSet::new())
            .await
            .is_err());
        assert!(agent.firewall_refresh_needed());
        assert_eq!(agent.devices_to_refilter(), ids(&["p2"]));

        agent
            .setup_port_filters(&ids(&["p1"]), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(
            *firewall.calls.lock(),
            vec!["prepare:p1".to_string(), "update:p2".to_string()]
        );
        assert!(!agent.firewall_refresh_needed());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_global_refresh() {
        let (firewall, agent) = flaky_agent(1);
        firewall
            .filtered
            .lock()
            .insert("p1".to_string(), PortFilter::new("p1", ["sg-p1"]));
        agent.security_groups_provider_updated(None);

        assert!(agent
            .setup_port_filters(&BTreeSet::new(), &BTreeSet::new())
            .await
            .is_err());
        assert!(agent.firewall_refresh_needed());

        agent
            .setup_port_filters(&BTreeSet::new(), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(*firewall.calls.lock(), vec!["update:p1".to_string()]);
        assert!(!agent.firewall_refresh_needed());
    }
}
