//! Agent daemon loop.
//!
//! Each iteration runs a full sync when the agent is out of sync, processes
//! ports when there is work, then sleeps for what is left of the polling
//! interval. The run flag is checked once per iteration, so in-flight switch
//! calls always complete.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::agent::DvsAgent;
use crate::polling::PollingManager;
use crate::sync::PortStats;

/// Returns how long to sleep after an iteration that took `elapsed`, or
/// `None` if the iteration overran the interval.
pub fn wait_duration(interval: Duration, elapsed: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Outcome of one loop iteration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationReport {
    /// Iteration number.
    pub iter_num: u64,
    /// Whether a full sync ran and succeeded.
    pub full_synced: bool,
    /// Port counts, when ports were processed.
    pub port_stats: Option<PortStats>,
}

/// The reconciliation loop.
pub struct AgentDaemon {
    agent: DvsAgent,
    polling: PollingManager,
    polling_interval: Duration,
    iter_num: u64,
}

impl AgentDaemon {
    /// Creates the loop for `agent`.
    pub fn new(agent: DvsAgent) -> Self {
        let polling = PollingManager::new(agent.config().agent.minimize_polling);
        let polling_interval = agent.config().polling_interval();
        Self {
            agent,
            polling,
            polling_interval,
            iter_num: 0,
        }
    }

    /// The agent handle.
    pub fn agent(&self) -> &DvsAgent {
        &self.agent
    }

    /// Number of completed iterations.
    pub fn iter_num(&self) -> u64 {
        self.iter_num
    }

    /// Polling manager state.
    pub fn polling(&self) -> &PollingManager {
        &self.polling
    }

    /// Runs iterations until the agent is stopped.
    pub async fn rpc_loop(&mut self) {
        info!("Agent initialized successfully, now running...");
        while self.agent.is_running() {
            let start = Instant::now();
            self.run_iteration().await;
            self.loop_count_and_wait(start).await;
        }
        info!("Agent daemon loop stopped after {} iterations", self.iter_num);
    }

    /// Runs the work part of one iteration, without waiting.
    pub async fn run_iteration(&mut self) -> IterationReport {
        let mut report = IterationReport {
            iter_num: self.iter_num,
            ..Default::default()
        };

        if self.agent.needs_full_sync() {
            match self.agent.full_sync().await {
                Ok(_) => {
                    report.full_synced = true;
                    self.polling.force_polling();
                }
                Err(e) => error!("Full sync failed, retrying next iteration: {}", e),
            }
        }

        if self.agent.has_updates(&self.polling) {
            debug!("Agent rpc_loop - update");
            match self.agent.process_ports().await {
                Ok(stats) => {
                    debug!(
                        added = stats.added,
                        updated = stats.updated,
                        removed = stats.removed,
                        "ports processed"
                    );
                    report.port_stats = Some(stats);
                    self.polling.polling_completed();
                }
                Err(e) => error!("Error while processing ports: {}", e),
            }
        }
        report
    }

    /// Sleeps until the end of the polling interval that began at `start`
    /// and advances the iteration counter. Returns the time slept.
    pub async fn loop_count_and_wait(&mut self, start: Instant) -> Option<Duration> {
        let elapsed = start.elapsed();
        debug!(
            "Agent rpc_loop - iteration:{} completed. Elapsed:{:.3}",
            self.iter_num,
            elapsed.as_secs_f64()
        );
        let wait = wait_duration(self.polling_interval, elapsed);
        match wait {
            Some(duration) => tokio::time::sleep(duration).await,
            None => debug!(
                "Loop iteration exceeded interval ({:?} vs. {:?})!",
                self.polling_interval, elapsed
            ),
        }
        self.iter_num += 1;
        wait
    }
}
