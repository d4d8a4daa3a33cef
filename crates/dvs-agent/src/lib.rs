//! DVS agent.
//!
//! Reconciles the control plane's view of virtual ports with a vSphere
//! distributed virtual switch. The agent keeps an in-memory view of known
//! ports, ingests port update/delete notifications, periodically resyncs
//! against the switch inventory and drives the security-group firewall.
//!
//! # Components
//!
//! - [`PortStateTracker`]: known / added / updated / deleted / booked sets
//! - [`DvsAgent`]: shared state, lifecycle hooks, event ingestion
//! - [`AgentDaemon`]: the poll/wait loop
//! - [`StateReporter`]: heartbeat to the control plane
//! - [`NotificationPump`]: message-bus casts into the agent

pub mod agent;
pub mod config;
pub mod daemon;
pub mod firewall;
pub mod heartbeat;
pub mod notifications;
pub mod polling;
pub mod rpc;
pub mod security_group;
pub mod sync;
pub mod tracker;

pub use agent::{DvsAgent, DvsRpcHandler, SecurityGroupCallbacks};
pub use config::{AgentConfig, ConfigError, DEFAULT_CONFIG_PATH};
pub use daemon::{wait_duration, AgentDaemon, IterationReport};
pub use firewall::{FirewallDriver, PortFilter, VCenterFirewallDriver};
pub use heartbeat::StateReporter;
pub use notifications::{Notification, NotificationPump};
pub use polling::PollingManager;
pub use rpc::{
    AgentConfigurations, AgentStateReport, AgentStatus, DeviceDetail, DeviceDetails,
    LoopbackPluginRpc, LoopbackStateRpc, PluginRpc, StateRpc,
};
pub use security_group::{
    DvsSecurityGroupRpc, LoopbackSecurityGroupServer, SecurityGroupAgent, SecurityGroupServerRpc,
};
pub use sync::PortStats;
pub use tracker::PortStateTracker;
