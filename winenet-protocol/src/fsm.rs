//! Winenet state machine
//!
//! One [`Winenet`] instance runs per node and owns the neighbor table, the
//! speaker and listener sessions and every timer. It performs no I/O: the
//! host feeds it [`Event`]s together with the current time and carries out
//! the returned [`Action`]s. [`Winenet::next_deadline`] tells the host when
//! to call back if nothing else happens.
//!
//! ```text
//!            start()
//!   Init ─────────────▶ Idle ◀──────────────────────────┐
//!                        │  │                           │
//!     BROADCAST_SPEAKER  │  │ data queued + admission   │ completed / aborted
//!                        ▼  ▼                           │
//!                  Listener ──── GO_SPEAKER ────▶ Speaker
//!                        │
//!                        └── watchdog / release ──▶ Idle
//! ```

use crate::beacon::{AckStatus, Beacon, Direction, NeighborState, SpeakerCause};
use crate::config::{ConfigError, WinenetConfig};
use crate::election::{
    self, Admission, AdmissionInput, BidProgress, BidTimeout, Candidate, ElectionConflict,
    PingRole, SpeakerBid, Tiebreaker,
};
use crate::neighbor::{NeighborEvent, NeighborTable};
use crate::outcome::{AbortReason, DeliveryOutcome, SubmissionId};
use crate::packet::{DataPacket, Packet};
use crate::peer::PeerId;
use crate::reliability::{self, RxSession, TxProgress, TxSession, MAX_PACKETS_PER_BUFFER};
use crate::timer::{earliest, Timer};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

/// Protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, not started
    Init,
    /// Neither sending nor bound to a speaker
    Idle,
    /// Owns the medium
    Speaker,
    /// Bound to a speaker
    Listener,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "INIT",
            State::Idle => "IDLE",
            State::Speaker => "SPEAKER",
            State::Listener => "LISTENER",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Discovery reports a reachable peer
    PeerJoined(PeerId),
    /// Discovery reports a peer as gone
    PeerLeft(PeerId),
    /// Bytes received from the medium
    Received { from: PeerId, bytes: Bytes },
    /// The upper layer submits a buffer
    Submit { id: SubmissionId, buffer: Bytes },
    /// Timer check only
    Tick,
}

/// Work for the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Put bytes on the medium; `None` broadcasts
    Transmit { dest: Option<PeerId>, bytes: Bytes },
    /// A buffer was received completely
    Deliver { from: PeerId, buffer: Bytes },
    /// A submitted buffer finished
    Outcome {
        id: SubmissionId,
        outcome: DeliveryOutcome,
    },
    /// The protocol state changed
    StateChanged { from: State, to: State },
}

/// Protocol counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WinenetStats {
    pub beacons_sent: u64,
    pub beacons_received: u64,
    pub data_packets_sent: u64,
    pub data_packets_received: u64,
    pub retransmissions: u64,
    pub decode_errors: u64,
    pub buffers_sent: u64,
    pub buffers_delivered: u64,
    pub sessions_aborted: u64,
    pub elections_yielded: u64,
}

#[derive(Debug)]
struct Submission {
    id: SubmissionId,
    buffer: Bytes,
}

#[derive(Debug)]
struct PendingPing {
    timer: Timer,
    attempts_left: u8,
}

#[derive(Debug)]
enum Speaking {
    /// Claim sent, collecting listener ACKs
    Bidding { bid: SpeakerBid, submission: Submission },
    /// Sending frames to the bound listeners
    Transmitting {
        tx: TxSession,
        id: SubmissionId,
        bound: Vec<PeerId>,
    },
}

/// Winenet protocol instance for one node
#[derive(Debug)]
pub struct Winenet {
    own: PeerId,
    config: WinenetConfig,
    state: State,
    neighbors: NeighborTable,
    tiebreaker: Tiebreaker,
    /// Speaker we are bound to; ourselves while speaking
    paired_speaker: Option<PeerId>,
    speaking: Option<Speaking>,
    rx: Option<RxSession>,
    pings: BTreeMap<PeerId, PendingPing>,
    /// Peers expected to PING us, with the time we stop waiting
    awaiting_ping: BTreeMap<PeerId, Instant>,
    outbox: VecDeque<Submission>,
    backoff_until: Option<Instant>,
    stats: WinenetStats,
    actions: Vec<Action>,
}

impl Winenet {
    /// Create a node in the `Init` state
    pub fn new(own: PeerId, config: WinenetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Winenet {
            own,
            tiebreaker: Tiebreaker::new(config.rng_seed),
            config,
            state: State::Init,
            neighbors: NeighborTable::new(),
            paired_speaker: None,
            speaking: None,
            rx: None,
            pings: BTreeMap::new(),
            awaiting_ping: BTreeMap::new(),
            outbox: VecDeque::new(),
            backoff_until: None,
            stats: WinenetStats::default(),
            actions: Vec::new(),
        })
    }

    pub fn own_id(&self) -> PeerId {
        self.own
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &WinenetConfig {
        &self.config
    }

    pub fn paired_speaker(&self) -> Option<PeerId> {
        self.paired_speaker
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn stats(&self) -> &WinenetStats {
        &self.stats
    }

    /// Buffers waiting for a speaker turn
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Listeners of the transfer in progress, empty unless sending data
    pub fn session_listeners(&self) -> Vec<PeerId> {
        match &self.speaking {
            Some(Speaking::Transmitting { tx, .. }) => tx.listeners().collect(),
            _ => Vec::new(),
        }
    }

    /// Snapshot reported to QUERY_STATE requests
    pub fn neighbor_state(&self) -> NeighborState {
        let in_progress_transid = match (&self.speaking, &self.rx) {
            (Some(Speaking::Transmitting { tx, .. }), _) => Some(tx.transid_cursor() as u32),
            (_, Some(rx)) => Some(rx.expected()),
            _ => None,
        };
        NeighborState {
            paired_speaker: self.paired_speaker,
            in_progress_transid,
            has_pending_packet_data: !self.outbox.is_empty() || self.speaking.is_some(),
            rand_tiebreak: self.tiebreaker.current(),
        }
    }

    /// Leave `Init` and start validating the known neighbors
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        if self.state != State::Init {
            return Vec::new();
        }
        self.set_state(State::Idle);
        // Peers reported before start are still queued as Joined events
        self.apply_neighbor_events(now);
        self.try_admission(now);
        std::mem::take(&mut self.actions)
    }

    /// Feed one event and collect the resulting actions
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::PeerJoined(peer) => self.on_peer_joined(peer, now),
            Event::PeerLeft(peer) => {
                self.neighbors.remove(peer);
            }
            Event::Received { from, bytes } => self.on_receive(from, &bytes, now),
            Event::Submit { id, buffer } => self.on_submit(id, buffer),
            Event::Tick => {}
        }
        self.apply_neighbor_events(now);
        self.process_timers(now);
        self.try_admission(now);
        std::mem::take(&mut self.actions)
    }

    /// Shorthand for `handle(Event::Tick, now)`
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Action> {
        self.handle(Event::Tick, now)
    }

    /// Earliest instant at which a timer needs servicing
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = None;
        for ping in self.pings.values() {
            deadline = earliest(deadline, ping.timer.deadline());
        }
        for until in self.awaiting_ping.values() {
            deadline = earliest(deadline, Some(*until));
        }
        if let Some(rx) = &self.rx {
            deadline = earliest(deadline, rx.deadline());
        }
        match &self.speaking {
            Some(Speaking::Bidding { bid, .. }) => deadline = earliest(deadline, bid.deadline()),
            Some(Speaking::Transmitting { tx, .. }) => deadline = earliest(deadline, tx.deadline()),
            None => {}
        }
        if self.state == State::Idle && !self.outbox.is_empty() {
            deadline = earliest(deadline, self.backoff_until);
            deadline = earliest(deadline, self.session_reported_until());
        }
        deadline
    }

    // Discovery feed

    fn on_peer_joined(&mut self, peer: PeerId, now: Instant) {
        if peer == self.own {
            return;
        }
        let inserted = self.neighbors.upsert(peer);
        if !inserted && self.state != State::Init && !self.neighbors.is_valid(peer) {
            // Discovery refresh of a peer still not validated
            self.expect_validation(peer, now);
        }
    }

    fn expect_validation(&mut self, peer: PeerId, now: Instant) {
        match election::ping_role(self.own, peer) {
            PingRole::Initiator => self.start_ping(peer, now),
            PingRole::Responder => {
                let patience = self.config.ack_timeout * (u32::from(self.config.max_retries) + 1);
                self.awaiting_ping.insert(peer, now + patience);
            }
        }
    }

    fn apply_neighbor_events(&mut self, now: Instant) {
        if self.state == State::Init {
            return;
        }
        for event in self.neighbors.drain_events() {
            match event {
                NeighborEvent::Joined(peer) => {
                    tracing::debug!("{}: neighbor {} joined", self.own, peer);
                    self.expect_validation(peer, now);
                }
                NeighborEvent::Left(peer) => {
                    tracing::info!("{}: neighbor {} left", self.own, peer);
                    self.pings.remove(&peer);
                    self.awaiting_ping.remove(&peer);
                    self.lose_peer(peer, now);
                }
                NeighborEvent::Validated(peer) => {
                    tracing::info!("{}: neighbor {} validated", self.own, peer);
                    self.pings.remove(&peer);
                    self.awaiting_ping.remove(&peer);
                    if election::ping_role(self.own, peer) == PingRole::Initiator {
                        self.send_beacon(Some(peer), Beacon::QueryState(None));
                    }
                }
            }
        }
    }

    fn lose_peer(&mut self, peer: PeerId, now: Instant) {
        if self.state == State::Listener && self.paired_speaker == Some(peer) {
            tracing::warn!("{}: speaker {} lost", self.own, peer);
            self.close_listener();
            return;
        }

        match self.speaking.take() {
            Some(Speaking::Bidding {
                mut bid,
                submission,
            }) => match bid.remove_peer(peer) {
                BidProgress::Waiting => {
                    self.speaking = Some(Speaking::Bidding { bid, submission });
                }
                BidProgress::Settled(accepted) => {
                    self.start_transmission(submission, accepted, now)
                }
            },
            Some(Speaking::Transmitting { mut tx, id, bound }) => {
                let progress = tx.remove_listener(peer, now);
                let bound = bound.into_iter().filter(|p| *p != peer).collect();
                self.apply_tx(progress, tx, id, bound, now);
            }
            None => {}
        }
    }

    // Upper layer

    fn on_submit(&mut self, id: SubmissionId, buffer: Bytes) {
        let packets = reliability::packet_count(buffer.len(), self.config.packet_size);
        if packets > MAX_PACKETS_PER_BUFFER {
            tracing::warn!(
                "{}: buffer {} needs {} packets, rejecting",
                self.own,
                id,
                packets
            );
            self.report(id, DeliveryOutcome::Aborted(AbortReason::Oversized));
            return;
        }
        tracing::debug!("{}: queued buffer {} ({} bytes)", self.own, id, buffer.len());
        self.outbox.push_back(Submission { id, buffer });
    }

    // Medium

    fn on_receive(&mut self, from: PeerId, bytes: &[u8], now: Instant) {
        if from == self.own || self.state == State::Init {
            return;
        }
        if self.neighbors.get(from).is_none() {
            tracing::trace!("{}: ignoring traffic from unknown peer {}", self.own, from);
            return;
        }

        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::warn!("{}: discarding malformed packet from {}: {}", self.own, from, e);
                return;
            }
        };

        if self.state == State::Listener && self.paired_speaker == Some(from) {
            if let Some(rx) = self.rx.as_mut() {
                rx.touch(now);
            }
        }

        match packet {
            Packet::Beacon(beacon) => {
                self.stats.beacons_received += 1;
                tracing::debug!("{}: received {} from {}", self.own, beacon, from);
                self.on_beacon(from, beacon, now);
            }
            Packet::Data(data) => {
                self.stats.data_packets_received += 1;
                self.on_data(from, &data, now);
            }
        }
    }

    fn on_beacon(&mut self, from: PeerId, beacon: Beacon, now: Instant) {
        match beacon {
            Beacon::Ping(Direction::Request) => {
                self.pings.remove(&from);
                self.neighbors.mark_valid(from);
                self.send_beacon(Some(from), Beacon::Ping(Direction::Response));
            }
            Beacon::Ping(Direction::Response) => {
                self.pings.remove(&from);
                self.neighbors.mark_valid(from);
            }
            Beacon::QueryState(None) => {
                let state = self.neighbor_state();
                self.send_beacon(Some(from), Beacon::QueryState(Some(state)));
            }
            Beacon::QueryState(Some(state)) => {
                if let (Some(speaker), Some(_)) = (state.paired_speaker, state.in_progress_transid) {
                    tracing::debug!("{}: {} reports a session led by {}", self.own, from, speaker);
                }
                self.neighbors.record_report(from, state, now);
            }
            Beacon::BroadcastSpeaker {
                cause: SpeakerCause::Claim,
                rand_tiebreak,
            } => {
                self.neighbors.forget_reports_of(from);
                if let Some(entry) = self.neighbors.get_mut(from) {
                    entry.rand_tiebreak = rand_tiebreak;
                }
                self.on_claim(from, rand_tiebreak, now);
            }
            Beacon::BroadcastSpeaker {
                cause: SpeakerCause::Release,
                ..
            } => {
                self.neighbors.forget_reports_of(from);
                if let Some(entry) = self.neighbors.get_mut(from) {
                    entry.paired_speaker = None;
                }
                if self.state == State::Listener && self.paired_speaker == Some(from) {
                    tracing::info!("{}: released by speaker {}", self.own, from);
                    self.close_listener();
                }
            }
            Beacon::GoSpeaker => self.on_go_speaker(from, now),
            Beacon::Ack {
                status,
                last_transid,
            } => self.on_ack(from, status, last_transid, now),
        }
    }

    fn on_claim(&mut self, from: PeerId, rand_tiebreak: u32, now: Instant) {
        match self.state {
            State::Init => {}
            State::Idle => self.become_listener(from, now),
            State::Listener => {
                if self.paired_speaker == Some(from) {
                    // Our ACK was lost, or the speaker starts a new buffer
                    self.become_listener(from, now);
                } else {
                    self.send_beacon(Some(from), Beacon::ack(AckStatus::Abort));
                }
            }
            State::Speaker => match self.speaking.take() {
                Some(Speaking::Bidding { bid, submission }) => {
                    let rival = Candidate::new(from, rand_tiebreak);
                    match bid.on_rival_claim(self.own, rival) {
                        Ok(()) => {
                            tracing::debug!("{}: claim of {} outranked", self.own, from);
                            self.speaking = Some(Speaking::Bidding { bid, submission });
                            self.send_beacon(Some(from), Beacon::ack(AckStatus::Abort));
                        }
                        Err(conflict) => {
                            self.yield_bid(bid, submission, conflict, now);
                            self.become_listener(from, now);
                        }
                    }
                }
                other => {
                    self.speaking = other;
                    self.send_beacon(Some(from), Beacon::ack(AckStatus::Abort));
                }
            },
        }
    }

    fn on_go_speaker(&mut self, from: PeerId, now: Instant) {
        match self.state {
            State::Listener if self.paired_speaker == Some(from) => {
                tracing::info!("{}: speaker token received from {}", self.own, from);
                self.rx = None;
                self.paired_speaker = None;
                self.enter_speaker(now);
            }
            State::Idle => {
                if self.outbox.is_empty() {
                    tracing::debug!("{}: nothing to send, dropping token from {}", self.own, from);
                } else {
                    self.backoff_until = None;
                    self.enter_speaker(now);
                }
            }
            _ => {
                tracing::debug!("{}: ignoring token from {} in {}", self.own, from, self.state);
            }
        }
    }

    fn on_ack(
        &mut self,
        from: PeerId,
        status: AckStatus,
        last_transid: Option<u32>,
        now: Instant,
    ) {
        match self.speaking.take() {
            Some(Speaking::Bidding {
                mut bid,
                submission,
            }) if last_transid.is_none() => match bid.on_ack(from, status) {
                Ok(progress) => {
                    if status == AckStatus::Ok {
                        if let Some(entry) = self.neighbors.get_mut(from) {
                            entry.paired_speaker = Some(self.own);
                        }
                    }
                    match progress {
                        BidProgress::Waiting => {
                            self.speaking = Some(Speaking::Bidding { bid, submission });
                        }
                        BidProgress::Settled(accepted) => {
                            self.start_transmission(submission, accepted, now)
                        }
                    }
                }
                Err(conflict) => self.yield_bid(bid, submission, conflict, now),
            },
            Some(Speaking::Transmitting { mut tx, id, bound }) => match last_transid {
                Some(transid) => {
                    let progress = tx.on_ack(from, status, transid, now);
                    self.apply_tx(progress, tx, id, bound, now);
                }
                None => self.speaking = Some(Speaking::Transmitting { tx, id, bound }),
            },
            other => self.speaking = other,
        }
    }

    fn on_data(&mut self, from: PeerId, packet: &DataPacket, now: Instant) {
        if self.state != State::Listener || self.paired_speaker != Some(from) {
            return;
        }
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.on_packet(packet, now),
            None => return,
        };
        if let Some(ack) = outcome.ack {
            self.send_beacon(Some(from), ack);
        }
        if let Some(buffer) = outcome.delivered {
            self.stats.buffers_delivered += 1;
            tracing::info!(
                "{}: received buffer of {} bytes from {}",
                self.own,
                buffer.len(),
                from
            );
            self.actions.push(Action::Deliver { from, buffer });
        }
    }

    // Timers

    fn process_timers(&mut self, now: Instant) {
        let due: Vec<PeerId> = self
            .pings
            .iter()
            .filter(|(_, ping)| ping.timer.expired(now))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in due {
            let retry = match self.pings.get_mut(&peer) {
                Some(ping) if ping.attempts_left > 0 => {
                    ping.attempts_left -= 1;
                    ping.timer.arm(now);
                    true
                }
                _ => false,
            };
            if retry {
                self.send_beacon(Some(peer), Beacon::Ping(Direction::Request));
            } else {
                tracing::warn!("{}: PING to {} unanswered, giving up", self.own, peer);
                self.pings.remove(&peer);
            }
        }

        let own = self.own;
        self.awaiting_ping.retain(|peer, until| {
            let waiting = now < *until;
            if !waiting {
                tracing::warn!("{}: no PING from {}, giving up", own, peer);
            }
            waiting
        });

        if self.state == State::Listener && self.rx.as_ref().map_or(false, |rx| rx.expired(now)) {
            tracing::warn!(
                "{}: speaker {:?} silent, leaving listener state",
                self.own,
                self.paired_speaker
            );
            self.close_listener();
        }

        match self.speaking.take() {
            Some(Speaking::Bidding {
                mut bid,
                submission,
            }) => match bid.on_timeout(now) {
                BidTimeout::NotExpired => {
                    self.speaking = Some(Speaking::Bidding { bid, submission });
                }
                BidTimeout::Rebroadcast(pending) => {
                    tracing::debug!(
                        "{}: {} neighbor(s) silent, repeating claim",
                        self.own,
                        pending.len()
                    );
                    let claim = Beacon::BroadcastSpeaker {
                        cause: SpeakerCause::Claim,
                        rand_tiebreak: bid.rand_tiebreak(),
                    };
                    self.speaking = Some(Speaking::Bidding { bid, submission });
                    // Broadcast so bound listeners keep their watchdog alive
                    self.send_beacon(None, claim);
                }
                BidTimeout::Settled(accepted) => self.start_transmission(submission, accepted, now),
            },
            Some(Speaking::Transmitting { mut tx, id, bound }) => {
                let progress = tx.on_timeout(now);
                self.apply_tx(progress, tx, id, bound, now);
            }
            None => {}
        }
    }

    // Speaker side

    fn try_admission(&mut self, now: Instant) {
        if self.state != State::Idle {
            return;
        }
        if self.backoff_until.map_or(false, |until| now >= until) {
            // An expired backoff must not keep reporting a past deadline
            self.backoff_until = None;
        }
        self.neighbors.expire_reports(now, self.config.listener_timeout);
        let input = AdmissionInput {
            has_data: !self.outbox.is_empty(),
            paired_speaker: self.paired_speaker,
            valid_neighbors: self.neighbors.valid_count(),
            validation_pending: !self.pings.is_empty() || !self.awaiting_ping.is_empty(),
            backoff_until: self.backoff_until,
            session_reported_until: self.session_reported_until(),
        };
        match election::admission(input, now) {
            Admission::Granted => {
                self.backoff_until = None;
                if let Some(submission) = self.outbox.pop_front() {
                    self.begin_bid(submission, now);
                }
            }
            Admission::NoNeighbors => {
                while let Some(submission) = self.outbox.pop_front() {
                    tracing::warn!(
                        "{}: no neighbor for buffer {}",
                        self.own,
                        submission.id
                    );
                    self.report(
                        submission.id,
                        DeliveryOutcome::Aborted(AbortReason::NoNeighbors),
                    );
                }
            }
            Admission::NoData
            | Admission::Bound(_)
            | Admission::AwaitingValidation
            | Admission::Backoff(_) => {}
            Admission::SessionInProgress(until) => {
                tracing::debug!(
                    "{}: neighbors report a session in progress, waiting {:?}",
                    self.own,
                    until.saturating_duration_since(now)
                );
            }
        }
    }

    fn session_reported_until(&self) -> Option<Instant> {
        self.neighbors
            .foreign_session_until(self.own, self.config.listener_timeout)
    }

    fn enter_speaker(&mut self, now: Instant) {
        match self.outbox.pop_front() {
            Some(submission) => self.begin_bid(submission, now),
            None => {
                // Empty turn: pass the token on
                self.set_state(State::Speaker);
                self.paired_speaker = Some(self.own);
                self.hand_off(Vec::new(), now);
            }
        }
    }

    fn begin_bid(&mut self, submission: Submission, now: Instant) {
        let targets = self.neighbors.valid_peers();
        if targets.is_empty() {
            tracing::warn!("{}: no neighbor for buffer {}", self.own, submission.id);
            self.report(
                submission.id,
                DeliveryOutcome::Aborted(AbortReason::NoNeighbors),
            );
            self.set_state(State::Idle);
            return;
        }

        let rand_tiebreak = self.tiebreaker.refresh();
        let bid = SpeakerBid::new(
            targets,
            rand_tiebreak,
            self.config.max_retries,
            self.config.ack_timeout,
            now,
        );
        tracing::info!(
            "{}: claiming the medium for buffer {} (rand={})",
            self.own,
            submission.id,
            rand_tiebreak
        );
        self.paired_speaker = Some(self.own);
        self.set_state(State::Speaker);
        self.speaking = Some(Speaking::Bidding { bid, submission });
        self.send_beacon(
            None,
            Beacon::BroadcastSpeaker {
                cause: SpeakerCause::Claim,
                rand_tiebreak,
            },
        );
    }

    fn yield_bid(
        &mut self,
        bid: SpeakerBid,
        submission: Submission,
        conflict: ElectionConflict,
        now: Instant,
    ) {
        self.stats.elections_yielded += 1;
        tracing::info!("{}: {}, requeueing buffer {}", self.own, conflict, submission.id);
        self.release(&bid.accepted(), None);
        self.outbox.push_front(submission);
        self.speaking = None;
        self.paired_speaker = None;
        self.set_state(State::Idle);
        self.backoff_until = Some(now + self.tiebreaker.backoff(self.config.ack_timeout));
    }

    fn start_transmission(&mut self, submission: Submission, accepted: Vec<PeerId>, now: Instant) {
        if accepted.is_empty() {
            let reason = if self.neighbors.valid_count() == 0 {
                AbortReason::NoNeighbors
            } else {
                AbortReason::NoAck
            };
            self.abort_speaker(submission.id, reason, &[]);
            return;
        }

        match TxSession::new(submission.buffer, accepted.iter().copied(), &self.config) {
            Ok(mut tx) => {
                tracing::info!(
                    "{}: sending buffer {} to {} listener(s) in {} frame(s)",
                    self.own,
                    submission.id,
                    accepted.len(),
                    tx.frame_count()
                );
                for packet in tx.start(now) {
                    self.send_data(packet);
                }
                self.speaking = Some(Speaking::Transmitting {
                    tx,
                    id: submission.id,
                    bound: accepted,
                });
            }
            Err(e) => {
                tracing::warn!("{}: cannot send buffer {}: {}", self.own, submission.id, e);
                self.abort_speaker(submission.id, AbortReason::Oversized, &accepted);
            }
        }
    }

    fn apply_tx(
        &mut self,
        progress: TxProgress,
        tx: TxSession,
        id: SubmissionId,
        bound: Vec<PeerId>,
        now: Instant,
    ) {
        match progress {
            TxProgress::Waiting => {
                self.speaking = Some(Speaking::Transmitting { tx, id, bound });
            }
            TxProgress::Transmit {
                packets,
                retransmission,
            } => {
                if retransmission {
                    self.stats.retransmissions += packets.len() as u64;
                    tracing::debug!(
                        "{}: resending frame {} of buffer {}",
                        self.own,
                        tx.frame_cursor(),
                        id
                    );
                }
                for packet in packets {
                    self.send_data(packet);
                }
                self.speaking = Some(Speaking::Transmitting { tx, id, bound });
            }
            TxProgress::Completed => {
                self.stats.buffers_sent += 1;
                tracing::info!(
                    "{}: buffer {} delivered ({} packets)",
                    self.own,
                    id,
                    tx.packet_count()
                );
                self.report(id, DeliveryOutcome::Completed);
                self.hand_off(bound, now);
            }
            TxProgress::Aborted(reason) => {
                self.abort_speaker(id, reason, &bound);
            }
        }
    }

    /// Pass the token to the next neighbor of the round, free the rest
    fn hand_off(&mut self, bound: Vec<PeerId>, now: Instant) {
        let next = self.neighbors.next_unprocessed_in_round();
        if let Some(next) = next {
            tracing::info!("{}: handing speaker token to {}", self.own, next);
            if let Some(entry) = self.neighbors.get_mut(next) {
                entry.paired_speaker = Some(next);
            }
            self.send_beacon(Some(next), Beacon::GoSpeaker);
        }
        self.release(&bound, next);
        self.speaking = None;
        self.paired_speaker = None;
        self.set_state(State::Idle);
        if !self.outbox.is_empty() {
            // Let the token holder claim first
            self.backoff_until = Some(now + self.tiebreaker.backoff(self.config.ack_timeout));
        }
    }

    fn abort_speaker(&mut self, id: SubmissionId, reason: AbortReason, bound: &[PeerId]) {
        self.stats.sessions_aborted += 1;
        tracing::warn!("{}: buffer {} aborted: {:?}", self.own, id, reason);
        self.report(id, DeliveryOutcome::Aborted(reason));
        self.release(bound, None);
        self.speaking = None;
        self.paired_speaker = None;
        self.set_state(State::Idle);
    }

    fn release(&mut self, bound: &[PeerId], except: Option<PeerId>) {
        let release = Beacon::BroadcastSpeaker {
            cause: SpeakerCause::Release,
            rand_tiebreak: self.tiebreaker.current(),
        };
        for &peer in bound.iter().filter(|p| Some(**p) != except) {
            if let Some(entry) = self.neighbors.get_mut(peer) {
                entry.paired_speaker = None;
            }
            self.send_beacon(Some(peer), release);
        }
    }

    // Listener side

    fn become_listener(&mut self, speaker: PeerId, now: Instant) {
        self.paired_speaker = Some(speaker);
        if let Some(entry) = self.neighbors.get_mut(speaker) {
            entry.paired_speaker = Some(speaker);
        }
        self.rx = Some(RxSession::new(
            speaker,
            self.config.frame_size,
            self.config.listener_timeout,
            now,
        ));
        self.set_state(State::Listener);
        self.send_beacon(Some(speaker), Beacon::ack(AckStatus::Ok));
    }

    fn close_listener(&mut self) {
        if let Some(rx) = self.rx.take() {
            if rx.partial_len() > 0 && !rx.is_complete() {
                tracing::warn!(
                    "{}: dropping {} bytes of partial buffer from {}",
                    self.own,
                    rx.partial_len(),
                    rx.paired_speaker()
                );
            }
        }
        self.paired_speaker = None;
        self.set_state(State::Idle);
    }

    // Output helpers

    fn start_ping(&mut self, peer: PeerId, now: Instant) {
        let mut timer = Timer::new(self.config.ack_timeout);
        timer.arm(now);
        self.pings.insert(
            peer,
            PendingPing {
                timer,
                attempts_left: self.config.max_retries - 1,
            },
        );
        self.send_beacon(Some(peer), Beacon::Ping(Direction::Request));
    }

    fn send_beacon(&mut self, dest: Option<PeerId>, beacon: Beacon) {
        self.stats.beacons_sent += 1;
        tracing::debug!("{}: sending {} to {:?}", self.own, beacon, dest);
        self.actions.push(Action::Transmit {
            dest,
            bytes: Packet::Beacon(beacon).to_bytes(),
        });
    }

    fn send_data(&mut self, packet: DataPacket) {
        self.stats.data_packets_sent += 1;
        self.actions.push(Action::Transmit {
            dest: None,
            bytes: Packet::Data(packet).to_bytes(),
        });
    }

    fn report(&mut self, id: SubmissionId, outcome: DeliveryOutcome) {
        self.actions.push(Action::Outcome { id, outcome });
    }

    fn set_state(&mut self, to: State) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        tracing::info!("{}: {} -> {}", self.own, from, to);
        self.actions.push(Action::StateChanged { from, to });
    }
}
