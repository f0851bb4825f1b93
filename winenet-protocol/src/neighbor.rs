//! Neighbor table
//!
//! Tracks the peers the Discovery feed reports as reachable, in the order
//! they appeared, together with the attributes the election needs. Discovery
//! only adds and removes entries; validation and the election fields are
//! owned by the FSM.
//!
//! Every mutation queues a [`NeighborEvent`] which the FSM drains after
//! applying a Discovery update.

use crate::beacon::NeighborState;
use crate::peer::PeerId;
use std::time::{Duration, Instant};

/// One reachable peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    /// Peer identity
    pub peer_id: PeerId,
    /// Set once a PING exchange completed with this peer
    pub valid: bool,
    /// Already chosen as handoff target in the current round
    pub processed: bool,
    /// Speaker this peer is known to be bound to
    pub paired_speaker: Option<PeerId>,
    /// Last tie-break value announced by this peer
    pub rand_tiebreak: u32,
    /// Last QUERY_STATE response received from this peer
    pub last_report: Option<NeighborState>,
    /// When `last_report` arrived
    pub reported_at: Option<Instant>,
}

impl NeighborEntry {
    /// Speaker of a session this peer reported to be part of
    ///
    /// Only a report naming both a speaker and a transID in flight counts.
    pub fn reported_session(&self) -> Option<PeerId> {
        let report = self.last_report.as_ref()?;
        report.in_progress_transid?;
        report.paired_speaker
    }
}

impl NeighborEntry {
    fn new(peer_id: PeerId) -> Self {
        NeighborEntry {
            peer_id,
            valid: false,
            processed: false,
            paired_speaker: None,
            rand_tiebreak: 0,
            last_report: None,
            reported_at: None,
        }
    }
}

/// Change notification published by the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEvent {
    Joined(PeerId),
    Left(PeerId),
    Validated(PeerId),
}

/// Insertion-ordered set of neighbors
#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: Vec<NeighborEntry>,
    events: Vec<NeighborEvent>,
}

impl NeighborTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer if unknown; returns true if it was inserted
    pub fn upsert(&mut self, peer_id: PeerId) -> bool {
        if self.position(peer_id).is_some() {
            return false;
        }
        self.entries.push(NeighborEntry::new(peer_id));
        self.events.push(NeighborEvent::Joined(peer_id));
        true
    }

    /// Remove a peer, returning its last entry
    pub fn remove(&mut self, peer_id: PeerId) -> Option<NeighborEntry> {
        let index = self.position(peer_id)?;
        let entry = self.entries.remove(index);
        self.events.push(NeighborEvent::Left(peer_id));
        Some(entry)
    }

    /// Mark a peer valid; returns true if it was not valid before
    pub fn mark_valid(&mut self, peer_id: PeerId) -> bool {
        let Some(entry) = self.get_mut(peer_id) else {
            return false;
        };
        if entry.valid {
            return false;
        }
        entry.valid = true;
        self.events.push(NeighborEvent::Validated(peer_id));
        true
    }

    /// Look up a peer
    pub fn get(&self, peer_id: PeerId) -> Option<&NeighborEntry> {
        self.entries.iter().find(|entry| entry.peer_id == peer_id)
    }

    pub(crate) fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut NeighborEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.peer_id == peer_id)
    }

    /// Check if a peer is present and valid
    pub fn is_valid(&self, peer_id: PeerId) -> bool {
        self.get(peer_id).map_or(false, |entry| entry.valid)
    }

    /// Iterate over valid neighbors in insertion order
    ///
    /// The iterator borrows the table, so it observes a stable snapshot and
    /// can be cloned to restart.
    pub fn iter_valid(&self) -> impl Iterator<Item = &NeighborEntry> + Clone {
        self.entries.iter().filter(|entry| entry.valid)
    }

    /// Identities of the valid neighbors in insertion order
    pub fn valid_peers(&self) -> Vec<PeerId> {
        self.iter_valid().map(|entry| entry.peer_id).collect()
    }

    /// Number of valid neighbors
    pub fn valid_count(&self) -> usize {
        self.iter_valid().count()
    }

    /// Iterate over all entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.iter()
    }

    /// Store a QUERY_STATE response of `peer_id`
    pub fn record_report(&mut self, peer_id: PeerId, report: NeighborState, now: Instant) {
        if let Some(entry) = self.get_mut(peer_id) {
            entry.rand_tiebreak = report.rand_tiebreak;
            entry.last_report = Some(report);
            entry.reported_at = Some(now);
        }
    }

    /// Instant until which valid neighbors report a session led by a speaker
    /// other than `own`
    ///
    /// A report is trusted for `lifetime` after it arrived.
    pub fn foreign_session_until(&self, own: PeerId, lifetime: Duration) -> Option<Instant> {
        self.iter_valid()
            .filter(|entry| entry.reported_session().map_or(false, |speaker| speaker != own))
            .filter_map(|entry| entry.reported_at)
            .map(|at| at + lifetime)
            .max()
    }

    /// Drop session reports older than `lifetime`
    pub fn expire_reports(&mut self, now: Instant, lifetime: Duration) {
        for entry in &mut self.entries {
            if entry.reported_session().is_none() {
                continue;
            }
            if entry.reported_at.map_or(true, |at| now >= at + lifetime) {
                entry.last_report = None;
                entry.reported_at = None;
            }
        }
    }

    /// Drop the session reports that `speaker` sent or that name it
    ///
    /// Called when `speaker` announces a claim or a release, which makes
    /// any earlier picture of its session out of date.
    pub fn forget_reports_of(&mut self, speaker: PeerId) {
        for entry in &mut self.entries {
            let stale = entry.peer_id == speaker || entry.reported_session() == Some(speaker);
            if stale && entry.reported_session().is_some() {
                entry.last_report = None;
                entry.reported_at = None;
            }
        }
    }

    /// Pick the next handoff target of the current round
    ///
    /// Returns the first valid neighbor not yet processed and marks it. Once
    /// every valid neighbor has been processed the round starts over and
    /// `None` is returned.
    pub fn next_unprocessed_in_round(&mut self) -> Option<PeerId> {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.valid && !entry.processed)
        {
            Some(entry) => {
                entry.processed = true;
                Some(entry.peer_id)
            }
            None => {
                self.reset_round();
                None
            }
        }
    }

    /// Clear the processed marks
    pub fn reset_round(&mut self) {
        for entry in &mut self.entries {
            entry.processed = false;
        }
    }

    /// Take the queued change notifications
    pub fn drain_events(&mut self) -> Vec<NeighborEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, peer_id: PeerId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.peer_id == peer_id)
    }
}
