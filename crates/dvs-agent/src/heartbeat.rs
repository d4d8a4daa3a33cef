//! Agent state reporting.
//!
//! Runs on its own timer and shares only the out-of-sync flag with the
//! daemon loop. Report failures are logged and never stop the agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::agent::DvsAgent;
use crate::config::ConfigError;
use crate::rpc::{AgentConfigurations, AgentStateReport, AgentStatus, StateRpc};

/// Sends periodic state reports for one agent.
pub struct StateReporter {
    agent: DvsAgent,
    state_rpc: Arc<dyn StateRpc>,
    state: AgentStateReport,
}

impl StateReporter {
    /// Builds the initial report from the agent configuration.
    pub fn new(agent: DvsAgent, state_rpc: Arc<dyn StateRpc>) -> Result<Self, ConfigError> {
        let config = agent.config();
        let configurations = AgentConfigurations {
            bridge_mappings: config.bridge_mappings()?,
            vsphere_hostname: config.ml2_vmware.vsphere_hostname.clone(),
            log_agent_heartbeats: config.agent.log_agent_heartbeats,
        };
        let state = AgentStateReport::new(config.agent.host.clone(), configurations);
        Ok(Self {
            agent,
            state_rpc,
            state,
        })
    }

    /// The report sent on the next tick.
    pub fn state(&self) -> &AgentStateReport {
        &self.state
    }

    /// Sends one report. A `Revived` answer schedules a full sync; the start
    /// flag is dropped after the first successful report.
    pub async fn report_state(&mut self) {
        if self.state.configurations.log_agent_heartbeats {
            info!("Reporting agent state: {:?}", self.state);
        }
        match self.state_rpc.report_state(&self.state).await {
            Ok(status) => {
                if status == AgentStatus::Revived {
                    info!("Agent has just revived. Do a full sync.");
                    self.agent.request_full_sync();
                }
                self.state.start_flag = None;
                debug!(?status, "agent state reported");
            }
            Err(e) => error!("Failed reporting state!: {}", e),
        }
    }

    /// Spawns the heartbeat task. Returns `None` if `interval` is `None`.
    /// The task ends once the agent stops.
    pub fn spawn(mut self, interval: Option<Duration>) -> Option<JoinHandle<()>> {
        let interval = interval?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !self.agent.is_running() {
                    break;
                }
                self.report_state().await;
            }
            debug!("heartbeat stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::firewall::VCenterFirewallDriver;
    use crate::rpc::{LoopbackPluginRpc, MockStateRpc};
    use crate::security_group::{DvsSecurityGroupRpc, LoopbackSecurityGroupServer};
    use dvs_agent_common::{DvsError, NetworkMap};
    use mockall::Sequence;

    fn agent() -> DvsAgent {
        let mut config = AgentConfig::default();
        config.agent.host = "compute-1".to_string();
        config.ml2_vmware.network_maps = vec!["physnet1:dvs1".to_string()];
        DvsAgent::new(
            Arc::new(config),
            NetworkMap::new(),
            Arc::new(LoopbackPluginRpc),
            Arc::new(DvsSecurityGroupRpc::new(
                Arc::new(VCenterFirewallDriver),
                Arc::new(LoopbackSecurityGroupServer),
            )),
        )
    }

    #[tokio::test]
    async fn test_start_flag_cleared_after_success() {
        let agent = agent();
        let mut seq = Sequence::new();
        let mut rpc = MockStateRpc::new();
        rpc.expect_report_state()
            .withf(|state| state.start_flag == Some(true) && state.host == "compute-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(DvsError::rpc("report_state", "timeout")));
        rpc.expect_report_state()
            .withf(|state| state.start_flag == Some(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(AgentStatus::Alive));
        rpc.expect_report_state()
            .withf(|state| state.start_flag.is_none())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(AgentStatus::Alive));

        let mut reporter = StateReporter::new(agent, Arc::new(rpc)).unwrap();
        assert_eq!(
            reporter.state().configurations.bridge_mappings.get("physnet1"),
            Some(&"dvs1".to_string())
        );
        reporter.report_state().await;
        reporter.report_state().await;
        reporter.report_state().await;
    }

    #[tokio::test]
    async fn test_revived_requests_full_sync() {
        let agent = agent();
        agent.full_sync().await.unwrap();
        assert!(!agent.needs_full_sync());
        let mut rpc = MockStateRpc::new();
        rpc.expect_report_state()
            .returning(|_| Ok(AgentStatus::Revived));

        let mut reporter = StateReporter::new(agent.clone(), Arc::new(rpc)).unwrap();
        reporter.report_state().await;
        assert!(agent.needs_full_sync());
    }

    #[tokio::test]
    async fn test_disabled_heartbeat() {
        let reporter = StateReporter::new(agent(), Arc::new(MockStateRpc::new())).unwrap();
        assert!(reporter.spawn(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_until_stopped() {
        let agent = agent();
        let mut rpc = MockStateRpc::new();
        rpc.expect_report_state()
            .times(3)
            .returning(|_| Ok(AgentStatus::Alive));
        let reporter = StateReporter::new(agent.clone(), Arc::new(rpc)).unwrap();

        let handle = reporter.spawn(Some(Duration::from_secs(30))).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        agent.stop();
        handle.await.unwrap();
    }
}
