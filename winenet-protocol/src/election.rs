//! Speaker election
//!
//! Decides who validates a new neighbor, whether a node may claim the
//! medium, and which of two crossing speaker claims wins. A claim is
//! followed by a bid: the claimant collects an ACK from each valid neighbor
//! before it starts sending data.
//!
//! All decisions are pure functions of identities and tie-break values so
//! that every node reaches the same verdict from the same inputs.

use crate::beacon::AckStatus;
use crate::peer::PeerId;
use crate::timer::Timer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Side of a PING exchange a node plays with a given neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingRole {
    /// Sends the PING request
    Initiator,
    /// Waits for the request and answers it
    Responder,
}

/// The numerically lower identity issues the PING request
pub fn ping_role(own: PeerId, peer: PeerId) -> PingRole {
    if own < peer {
        PingRole::Initiator
    } else {
        PingRole::Responder
    }
}

/// A node competing for the speaker role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub peer_id: PeerId,
    pub rand_tiebreak: u32,
}

impl Candidate {
    pub fn new(peer_id: PeerId, rand_tiebreak: u32) -> Self {
        Candidate {
            peer_id,
            rand_tiebreak,
        }
    }

    /// Higher tie-break wins; on equal draws the higher identity wins
    pub fn outranks(&self, other: &Candidate) -> bool {
        (self.rand_tiebreak, self.peer_id) > (other.rand_tiebreak, other.peer_id)
    }
}

/// Verdict of a claim conflict, from the point of view of `own`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Win,
    Yield,
}

/// Resolve two crossing speaker claims
///
/// Symmetric: `resolve_conflict(a, b)` yields exactly when
/// `resolve_conflict(b, a)` wins, for distinct candidates.
pub fn resolve_conflict(own: Candidate, rival: Candidate) -> Resolution {
    if own.outranks(&rival) {
        Resolution::Win
    } else {
        Resolution::Yield
    }
}

/// Speaker admission verdict for an idle node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Claim the medium now
    Granted,
    /// Nothing queued
    NoData,
    /// Bound to a speaker
    Bound(PeerId),
    /// Neighbors are known but none is validated yet
    AwaitingValidation,
    /// No neighbor can be reached
    NoNeighbors,
    /// A neighbor reported a session of another speaker
    SessionInProgress(Instant),
    /// Backing off after a yield
    Backoff(Instant),
}

/// Inputs of the admission rule
#[derive(Debug, Clone, Copy)]
pub struct AdmissionInput {
    pub has_data: bool,
    pub paired_speaker: Option<PeerId>,
    pub valid_neighbors: usize,
    pub validation_pending: bool,
    pub backoff_until: Option<Instant>,
    /// End of the trust in a neighbor's report of a running session
    pub session_reported_until: Option<Instant>,
}

/// A node may claim the medium when it has data and holds no binding, as
/// long as it can reach a validated neighbor and no wait applies
///
/// A neighbor's report of another speaker's session defers the claim
/// until the report goes stale.
pub fn admission(input: AdmissionInput, now: Instant) -> Admission {
    if !input.has_data {
        return Admission::NoData;
    }
    if let Some(speaker) = input.paired_speaker {
        return Admission::Bound(speaker);
    }
    if input.valid_neighbors == 0 {
        return if input.validation_pending {
            Admission::AwaitingValidation
        } else {
            Admission::NoNeighbors
        };
    }
    if let Some(until) = input.session_reported_until {
        if now < until {
            return Admission::SessionInProgress(until);
        }
    }
    match input.backoff_until {
        Some(until) if now < until => Admission::Backoff(until),
        _ => Admission::Granted,
    }
}

/// Source of tie-break values and backoff jitter
#[derive(Debug)]
pub struct Tiebreaker {
    rng: StdRng,
    current: u32,
}

impl Tiebreaker {
    /// Create a tie-breaker, seeded for reproducible runs when asked
    pub fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let current = rng.gen();
        Tiebreaker { rng, current }
    }

    /// Value announced with the last claim
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Draw a fresh value for a new claim
    pub fn refresh(&mut self) -> u32 {
        self.current = self.rng.gen();
        self.current
    }

    /// Randomized wait in `[base, 2 * base)`
    pub fn backoff(&mut self, base: Duration) -> Duration {
        let jitter = self.rng.gen_range(0..base.as_micros().max(1) as u64);
        base + Duration::from_micros(jitter)
    }
}

/// A bid lost to another speaker
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Speaker claim lost to {rival}")]
pub struct ElectionConflict {
    pub rival: PeerId,
}

/// Bid progress after an ACK or a lost neighbor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidProgress {
    /// Still waiting for some neighbors
    Waiting,
    /// Every neighbor answered; the accepted listeners are returned
    Settled(Vec<PeerId>),
}

/// Bid progress on timer expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidTimeout {
    /// Timer not expired
    NotExpired,
    /// Repeat the claim to these neighbors
    Rebroadcast(Vec<PeerId>),
    /// Retry budget spent; proceed with whoever accepted
    Settled(Vec<PeerId>),
}

/// Binding phase of a new speaker
#[derive(Debug)]
pub struct SpeakerBid {
    rand_tiebreak: u32,
    pending: BTreeSet<PeerId>,
    accepted: BTreeSet<PeerId>,
    retries_left: u8,
    timer: Timer,
}

impl SpeakerBid {
    /// Start a bid towards `targets`; the initial claim is attempt one
    pub fn new(
        targets: impl IntoIterator<Item = PeerId>,
        rand_tiebreak: u32,
        max_retries: u8,
        ack_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut timer = Timer::new(ack_timeout);
        timer.arm(now);
        SpeakerBid {
            rand_tiebreak,
            pending: targets.into_iter().collect(),
            accepted: BTreeSet::new(),
            retries_left: max_retries,
            timer,
        }
    }

    pub fn rand_tiebreak(&self) -> u32 {
        self.rand_tiebreak
    }

    /// Listeners that accepted so far
    pub fn accepted(&self) -> Vec<PeerId> {
        self.accepted.iter().copied().collect()
    }

    /// Neighbors that have not answered yet
    pub fn pending(&self) -> Vec<PeerId> {
        self.pending.iter().copied().collect()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Record an ACK to the claim
    pub fn on_ack(
        &mut self,
        from: PeerId,
        status: AckStatus,
    ) -> Result<BidProgress, ElectionConflict> {
        if !self.pending.remove(&from) {
            // Duplicate ACK or not a target
            return Ok(BidProgress::Waiting);
        }
        match status {
            AckStatus::Ok => {
                self.accepted.insert(from);
                Ok(self.progress())
            }
            AckStatus::Timeout | AckStatus::Abort => Err(ElectionConflict { rival: from }),
        }
    }

    /// Resolve a claim received from `rival` while bidding
    pub fn on_rival_claim(&self, own: PeerId, rival: Candidate) -> Result<(), ElectionConflict> {
        match resolve_conflict(Candidate::new(own, self.rand_tiebreak), rival) {
            Resolution::Win => Ok(()),
            Resolution::Yield => Err(ElectionConflict {
                rival: rival.peer_id,
            }),
        }
    }

    /// Forget a neighbor that left
    pub fn remove_peer(&mut self, peer: PeerId) -> BidProgress {
        self.pending.remove(&peer);
        self.accepted.remove(&peer);
        self.progress()
    }

    /// Handle the claim timer
    pub fn on_timeout(&mut self, now: Instant) -> BidTimeout {
        if !self.timer.try_fire(now) {
            return BidTimeout::NotExpired;
        }
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            BidTimeout::Settled(self.accepted())
        } else {
            self.timer.arm(now);
            BidTimeout::Rebroadcast(self.pending())
        }
    }

    fn progress(&mut self) -> BidProgress {
        if self.pending.is_empty() {
            self.timer.cancel();
            BidProgress::Settled(self.accepted())
        } else {
            BidProgress::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: u64) -> PeerId {
        PeerId::new(raw)
    }

    #[test]
    fn test_lower_id_initiates_ping() {
        assert_eq!(ping_role(peer(1), peer(2)), PingRole::Initiator);
        assert_eq!(ping_role(peer(2), peer(1)), PingRole::Responder);
    }

    #[test]
    fn test_lower_rand_yields() {
        let a = Candidate::new(peer(1), 500);
        let b = Candidate::new(peer(2), 100);
        assert_eq!(resolve_conflict(a, b), Resolution::Win);
        assert_eq!(resolve_conflict(b, a), Resolution::Yield);
    }

    #[test]
    fn test_equal_rand_lower_id_yields() {
        let a = Candidate::new(peer(1), 42);
        let b = Candidate::new(peer(2), 42);
        assert_eq!(resolve_conflict(a, b), Resolution::Yield);
        assert_eq!(resolve_conflict(b, a), Resolution::Win);
    }

    #[test]
    fn test_admission_rules() {
        let now = Instant::now();
        let base = AdmissionInput {
            has_data: true,
            paired_speaker: None,
            valid_neighbors: 2,
            validation_pending: false,
            backoff_until: None,
            session_reported_until: None,
        };
        assert_eq!(admission(base, now), Admission::Granted);
        assert_eq!(
            admission(
                AdmissionInput {
                    has_data: false,
                    ..base
                },
                now
            ),
            Admission::NoData
        );
        assert_eq!(
            admission(
                AdmissionInput {
                    paired_speaker: Some(peer(9)),
                    ..base
                },
                now
            ),
            Admission::Bound(peer(9))
        );
        assert_eq!(
            admission(
                AdmissionInput {
                    valid_neighbors: 0,
                    ..base
                },
                now
            ),
            Admission::NoNeighbors
        );
        assert_eq!(
            admission(
                AdmissionInput {
                    valid_neighbors: 0,
                    validation_pending: true,
                    ..base
                },
                now
            ),
            Admission::AwaitingValidation
        );

        let until = now + Duration::from_millis(10);
        let backing_off = AdmissionInput {
            backoff_until: Some(until),
            ..base
        };
        assert_eq!(admission(backing_off, now), Admission::Backoff(until));
        assert_eq!(admission(backing_off, until), Admission::Granted);

        let session = AdmissionInput {
            session_reported_until: Some(until),
            ..base
        };
        assert_eq!(admission(session, now), Admission::SessionInProgress(until));
        assert_eq!(admission(session, until), Admission::Granted);
    }

    #[test]
    fn test_seeded_tiebreaker_is_reproducible() {
        let mut a = Tiebreaker::new(Some(7));
        let mut b = Tiebreaker::new(Some(7));
        assert_eq!(a.current(), b.current());
        assert_eq!(a.refresh(), b.refresh());

        let base = Duration::from_millis(800);
        let wait = a.backoff(base);
        assert!(wait >= base && wait < base * 2);
    }

    #[test]
    fn test_bid_settles_when_all_accept() {
        let now = Instant::now();
        let mut bid = SpeakerBid::new([peer(2), peer(3)], 10, 3, Duration::from_millis(100), now);

        assert_eq!(bid.on_ack(peer(2), AckStatus::Ok), Ok(BidProgress::Waiting));
        // Duplicate
        assert_eq!(bid.on_ack(peer(2), AckStatus::Ok), Ok(BidProgress::Waiting));
        assert_eq!(
            bid.on_ack(peer(3), AckStatus::Ok),
            Ok(BidProgress::Settled(vec![peer(2), peer(3)]))
        );
        assert_eq!(bid.deadline(), None);
    }

    #[test]
    fn test_bid_abort_is_conflict() {
        let now = Instant::now();
        let mut bid = SpeakerBid::new([peer(2)], 10, 3, Duration::from_millis(100), now);
        assert_eq!(
            bid.on_ack(peer(2), AckStatus::Abort),
            Err(ElectionConflict { rival: peer(2) })
        );
    }

    #[test]
    fn test_bid_rival_claim() {
        let now = Instant::now();
        let bid = SpeakerBid::new([peer(2)], 10, 3, Duration::from_millis(100), now);
        assert!(bid.on_rival_claim(peer(1), Candidate::new(peer(2), 5)).is_ok());
        assert_eq!(
            bid.on_rival_claim(peer(1), Candidate::new(peer(2), 10)),
            Err(ElectionConflict { rival: peer(2) })
        );
    }

    #[test]
    fn test_bid_retries_then_settles_with_partial_set() {
        let start = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut bid = SpeakerBid::new([peer(2), peer(3)], 10, 3, timeout, start);
        bid.on_ack(peer(2), AckStatus::Ok).unwrap();

        assert_eq!(bid.on_timeout(start), BidTimeout::NotExpired);
        assert_eq!(
            bid.on_timeout(start + timeout),
            BidTimeout::Rebroadcast(vec![peer(3)])
        );
        assert_eq!(
            bid.on_timeout(start + timeout * 2),
            BidTimeout::Rebroadcast(vec![peer(3)])
        );
        assert_eq!(
            bid.on_timeout(start + timeout * 3),
            BidTimeout::Settled(vec![peer(2)])
        );
    }

    #[test]
    fn test_bid_remove_last_pending_settles() {
        let now = Instant::now();
        let mut bid = SpeakerBid::new([peer(2), peer(3)], 10, 3, Duration::from_millis(100), now);
        bid.on_ack(peer(2), AckStatus::Ok).unwrap();
        assert_eq!(bid.remove_peer(peer(3)), BidProgress::Settled(vec![peer(2)]));
    }
}
