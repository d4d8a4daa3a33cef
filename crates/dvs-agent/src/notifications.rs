//! Message-bus notifications.
//!
//! The transport delivers casts into an mpsc channel; the pump applies them
//! to the agent. Handlers only mutate pending state, so the pump never
//! blocks on the switch.

use std::time::Duration;

use dvs_agent_common::{Port, PortId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::{DvsAgent, SecurityGroupCallbacks};

/// Capacity of the notification channel.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 1024;

/// A notification consumed by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `port` / `update`.
    PortUpdate(Port),
    /// `port` / `delete`.
    PortDelete {
        /// Deleted port.
        port_id: PortId,
    },
    /// `network` / `delete`.
    NetworkDelete {
        /// Deleted network.
        network_id: String,
    },
    /// `security_group` / `update`: rules changed.
    SecurityGroupRuleUpdated(Vec<String>),
    /// `security_group` / `update`: members changed.
    SecurityGroupMemberUpdated(Vec<String>),
    /// `security_group` / `update`: provider rules changed.
    SecurityGroupProviderUpdated(Option<Vec<PortId>>),
}

impl DvsAgent {
    /// Applies one notification.
    pub fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::PortUpdate(port) => self.port_update(&port),
            Notification::PortDelete { port_id } => self.port_delete(&port_id),
            Notification::NetworkDelete { network_id } => self.network_delete(&network_id),
            Notification::SecurityGroupRuleUpdated(groups) => {
                self.security_groups_rule_updated(&groups)
            }
            Notification::SecurityGroupMemberUpdated(groups) => {
                self.security_groups_member_updated(&groups)
            }
            Notification::SecurityGroupProviderUpdated(devices) => {
                self.security_groups_provider_updated(devices.as_deref())
            }
        }
    }
}

/// Task applying notifications from a channel to the agent.
pub struct NotificationPump {
    handle: JoinHandle<usize>,
}

impl NotificationPump {
    /// Creates the channel and spawns the pump. The pump ends when every
    /// sender is dropped.
    pub fn spawn(agent: DvsAgent) -> (mpsc::Sender<Notification>, Self) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        (tx, Self::with_receiver(agent, rx))
    }

    /// Spawns the pump over an existing receiver.
    pub fn with_receiver(agent: DvsAgent, mut rx: mpsc::Receiver<Notification>) -> Self {
        let handle = tokio::spawn(async move {
            let mut processed = 0usize;
            while let Some(notification) = rx.recv().await {
                agent.handle_notification(notification);
                processed += 1;
            }
            debug!(processed, "notification pump drained");
            processed
        });
        Self { handle }
    }

    /// Waits up to `timeout` for the pump to drain after the senders are
    /// dropped. Returns the number of notifications processed, or `None` if
    /// the pump was aborted.
    pub async fn shutdown(self, timeout: Duration) -> Option<usize> {
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(processed)) => Some(processed),
            Ok(Err(e)) => {
                warn!("notification pump failed: {}", e);
                None
            }
            Err(_) => {
                warn!("notification pump did not drain within {:?}", timeout);
                handle.abort();
                None
            }
        }
    }
}
