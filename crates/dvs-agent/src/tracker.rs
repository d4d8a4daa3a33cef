//! Port State Tracker.
//!
//! Owns the agent's view of virtual ports. Event ingestion and lifecycle
//! hooks only touch the pending sets (`added`, `updated`, `deleted`,
//! `booked`); the reconciliation engine is the only writer of `known`.
//!
//! A processing cycle takes snapshots of the pending sets. The `added`
//! snapshot stays in flight until [`PortStateTracker::complete_processing`]
//! merges it into `known`, so a delete that arrives while filters are being
//! set up still lands in `deleted`. The `updated` snapshot is held the same
//! way, so a failed cycle never re-queues a port deleted in the meantime.
//!
//! Invariant: `known`, `added`, `in_flight` and `deleted` are pairwise
//! disjoint between mutations.

use std::collections::BTreeSet;

use dvs_agent_common::PortId;
use tracing::debug;

/// Sets of port ids the agent tracks.
#[derive(Debug, Default, Clone)]
pub struct PortStateTracker {
    known: BTreeSet<PortId>,
    added: BTreeSet<PortId>,
    updated: BTreeSet<PortId>,
    deleted: BTreeSet<PortId>,
    booked: BTreeSet<PortId>,
    in_flight: BTreeSet<PortId>,
    updated_in_flight: BTreeSet<PortId>,
}

impl PortStateTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports believed provisioned and filtered.
    pub fn known(&self) -> &BTreeSet<PortId> {
        &self.known
    }

    /// Newly connected ports awaiting processing.
    pub fn added(&self) -> &BTreeSet<PortId> {
        &self.added
    }

    /// Ports with pending configuration changes.
    pub fn updated(&self) -> &BTreeSet<PortId> {
        &self.updated
    }

    /// Ports pending removal.
    pub fn deleted(&self) -> &BTreeSet<PortId> {
        &self.deleted
    }

    /// Ports reserved on a switch but not yet confirmed by update-postcommit.
    pub fn booked(&self) -> &BTreeSet<PortId> {
        &self.booked
    }

    /// Returns true if updates or deletions are pending.
    pub fn has_pending_changes(&self) -> bool {
        !self.updated.is_empty() || !self.deleted.is_empty()
    }

    /// Records a port booking.
    pub fn book(&mut self, port_id: &str) {
        self.booked.insert(port_id.to_string());
    }

    /// Promotes a booked port to `added`. Returns false if the port was not
    /// booked, so a port is promoted at most once per booking.
    pub fn promote_booked(&mut self, port_id: &str) -> bool {
        if !self.booked.remove(port_id) {
            return false;
        }
        if !self.known.contains(port_id) && !self.in_flight.contains(port_id) {
            self.added.insert(port_id.to_string());
        }
        debug!(port = %port_id, "booked port promoted to added");
        true
    }

    /// Queues a configuration change for a port.
    pub fn mark_updated(&mut self, port_id: &str) {
        self.updated.insert(port_id.to_string());
    }

    /// Handles a port delete notification. Delete wins over every pending
    /// state; only ports the engine has filtered are queued for removal.
    pub fn mark_deleted(&mut self, port_id: &str) {
        let filtered = self.known.remove(port_id) | self.in_flight.remove(port_id);
        if filtered {
            self.deleted.insert(port_id.to_string());
        }
        self.added.remove(port_id);
        self.updated.remove(port_id);
        self.updated_in_flight.remove(port_id);
        self.booked.remove(port_id);
    }

    /// Adds every connected port not yet known to `added`, returning the ids
    /// that were not already pending. Ports pending deletion are left alone.
    pub fn apply_full_sync(&mut self, connected: &BTreeSet<PortId>) -> BTreeSet<PortId> {
        let mut new = BTreeSet::new();
        for port_id in connected {
            if self.known.contains(port_id)
                || self.deleted.contains(port_id)
                || self.in_flight.contains(port_id)
            {
                continue;
            }
            if self.added.insert(port_id.clone()) {
                new.insert(port_id.clone());
            }
        }
        new
    }

    /// Takes the pending deletions.
    pub fn take_deleted(&mut self) -> BTreeSet<PortId> {
        std::mem::take(&mut self.deleted)
    }

    /// Puts back deletions that could not be processed.
    pub fn restore_deleted(&mut self, deleted: BTreeSet<PortId>) {
        self.deleted.extend(deleted);
    }

    /// Takes the pending additions and holds them in flight.
    pub fn take_added(&mut self) -> BTreeSet<PortId> {
        let added = std::mem::take(&mut self.added);
        self.in_flight.extend(added.iter().cloned());
        added
    }

    /// Takes the pending updates and holds them in flight.
    pub fn take_updated(&mut self) -> BTreeSet<PortId> {
        let updated = std::mem::take(&mut self.updated);
        self.updated_in_flight = updated.clone();
        updated
    }

    /// Merges the in-flight additions into `known`. Returns the merged ids.
    pub fn complete_processing(&mut self) -> BTreeSet<PortId> {
        let processed = std::mem::take(&mut self.in_flight);
        self.updated_in_flight.clear();
        self.known.extend(processed.iter().cloned());
        processed
    }

    /// Returns in-flight additions and updates to the pending sets after a
    /// failed cycle. Ports deleted during the cycle stay deleted.
    pub fn abort_processing(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        self.added.extend(in_flight);
        let updated = std::mem::take(&mut self.updated_in_flight);
        self.updated.extend(updated);
    }

    /// Returns true if the disjointness invariant holds.
    pub fn is_consistent(&self) -> bool {
        let sets = [&self.known, &self.added, &self.in_flight, &self.deleted];
        sets.iter().enumerate().all(|(i, a)| {
            sets.iter()
                .skip(i + 1)
                .all(|b| a.is_disjoint(b))
        })
    }
}
