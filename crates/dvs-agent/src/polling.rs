//! Polling manager for the reconciliation loop.

/// Decides whether an iteration must process ports.
///
/// Without `minimize_polling` every iteration polls. With it, only a forced
/// poll (startup or full sync) does; other work is signalled by pending
/// updates, deletions or firewall refreshes.
#[derive(Debug, Clone)]
pub struct PollingManager {
    minimize_polling: bool,
    force: bool,
}

impl PollingManager {
    /// Creates a manager. The first iteration always polls.
    pub fn new(minimize_polling: bool) -> Self {
        Self {
            minimize_polling,
            force: true,
        }
    }

    /// Requests a poll on the next iteration.
    pub fn force_polling(&mut self) {
        self.force = true;
    }

    /// Marks the requested poll as done.
    pub fn polling_completed(&mut self) {
        self.force = false;
    }

    /// Returns true if the next iteration must poll.
    pub fn is_polling_required(&self) -> bool {
        !self.minimize_polling || self.force
    }
}
