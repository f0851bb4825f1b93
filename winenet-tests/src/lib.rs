//! Deterministic multi-node harness
//!
//! [`SimNet`] drives several [`Winenet`] state machines on a virtual clock.
//! Frames travel with a fixed latency and can be lost at random (seeded),
//! through cut links, or through a programmable filter. Every transmission,
//! state change, delivery and outcome is recorded for the tests to inspect.
//! After every step the harness checks that no listener is claimed by two
//! transmitting speakers at once.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use winenet_protocol::{
    Action, DeliveryOutcome, Event, Packet, PeerId, State, SubmissionId, Winenet, WinenetConfig,
};

/// Default one-way latency of the simulated medium
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(1);

/// Decides whether a frame from `src` to `dst` is dropped
pub type DropFilter = Box<dyn FnMut(PeerId, PeerId, &Packet) -> bool>;

/// Something observed during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sent {
        at: Duration,
        from: PeerId,
        dest: Option<PeerId>,
        packet: Packet,
    },
    StateChanged {
        at: Duration,
        node: PeerId,
        from: State,
        to: State,
    },
}

impl Record {
    /// Simulated time of the record
    pub fn at(&self) -> Duration {
        match self {
            Record::Sent { at, .. } | Record::StateChanged { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    from: PeerId,
    to: PeerId,
    bytes: Bytes,
}

/// Simulated neighborhood of Winenet nodes
pub struct SimNet {
    nodes: BTreeMap<PeerId, Winenet>,
    start: Instant,
    now: Instant,
    latency: Duration,
    in_flight: BTreeMap<(Instant, u64), Frame>,
    sequence: u64,
    rng: StdRng,
    loss: f64,
    cut: BTreeSet<(PeerId, PeerId)>,
    filter: Option<DropFilter>,
    next_submission: u64,
    pending: BTreeSet<(PeerId, SubmissionId)>,
    outcomes: BTreeMap<PeerId, Vec<(SubmissionId, DeliveryOutcome)>>,
    deliveries: BTreeMap<PeerId, Vec<(PeerId, Bytes)>>,
    records: Vec<Record>,
    violations: Vec<String>,
}

impl SimNet {
    pub fn new(seed: u64) -> Self {
        let now = Instant::now();
        SimNet {
            nodes: BTreeMap::new(),
            start: now,
            now,
            latency: DEFAULT_LATENCY,
            in_flight: BTreeMap::new(),
            sequence: 0,
            rng: StdRng::seed_from_u64(seed),
            loss: 0.0,
            cut: BTreeSet::new(),
            filter: None,
            next_submission: 1,
            pending: BTreeSet::new(),
            outcomes: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            records: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Config with short timeouts, seeded per node
    pub fn test_config(id: u64) -> WinenetConfig {
        WinenetConfig {
            frame_size: 4,
            packet_size: 8,
            max_retries: 3,
            ack_timeout: Duration::from_millis(100),
            listener_timeout: Duration::from_millis(300),
            rng_seed: Some(id),
        }
    }

    /// Add a node with [`SimNet::test_config`]
    pub fn add(&mut self, id: u64) -> PeerId {
        self.add_with(id, Self::test_config(id))
    }

    pub fn add_with(&mut self, id: u64, config: WinenetConfig) -> PeerId {
        let peer = PeerId::new(id);
        match Winenet::new(peer, config) {
            Ok(node) => {
                self.nodes.insert(peer, node);
            }
            Err(e) => panic!("invalid config for node {}: {}", peer, e),
        }
        peer
    }

    pub fn node(&self, id: PeerId) -> &Winenet {
        &self.nodes[&id]
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.nodes.keys().copied().collect()
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Virtual time since the harness was created
    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    pub fn set_loss(&mut self, probability: f64) {
        self.loss = probability;
    }

    /// Frames for which the filter returns true are dropped
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(PeerId, PeerId, &Packet) -> bool + 'static,
    {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Stop frames between `a` and `b` in both directions
    pub fn cut(&mut self, a: PeerId, b: PeerId) {
        self.cut.insert((a.min(b), a.max(b)));
    }

    pub fn in_range(&self, a: PeerId, b: PeerId) -> bool {
        a != b && !self.cut.contains(&(a.min(b), a.max(b)))
    }

    /// Tell `node` that `peer` is reachable
    pub fn join(&mut self, node: PeerId, peer: PeerId) {
        self.feed(node, Event::PeerJoined(peer));
    }

    /// Tell `node` that `peer` is gone
    pub fn leave(&mut self, node: PeerId, peer: PeerId) {
        self.feed(node, Event::PeerLeft(peer));
    }

    /// Report every in-range pair to both sides
    pub fn discover_all(&mut self) {
        let ids = self.ids();
        for a in &ids {
            for b in &ids {
                if self.in_range(*a, *b) {
                    self.join(*a, *b);
                }
            }
        }
    }

    pub fn start(&mut self, id: PeerId) {
        let now = self.now;
        let actions = match self.nodes.get_mut(&id) {
            Some(node) => node.start(now),
            None => return,
        };
        self.dispatch(id, actions);
    }

    pub fn start_all(&mut self) {
        for id in self.ids() {
            self.start(id);
        }
    }

    /// Add nodes `1..=count`, discover, start, and settle validation
    pub fn mesh(count: u64, seed: u64) -> Self {
        let mut net = SimNet::new(seed);
        for id in 1..=count {
            net.add(id);
        }
        net.discover_all();
        net.start_all();
        net.run_for(Duration::from_millis(50));
        net
    }

    pub fn submit(&mut self, id: PeerId, buffer: Bytes) -> SubmissionId {
        let submission = SubmissionId(self.next_submission);
        self.next_submission += 1;
        self.pending.insert((id, submission));
        self.feed(
            id,
            Event::Submit {
                id: submission,
                buffer,
            },
        );
        submission
    }

    /// Inject raw bytes as if received from `from`
    pub fn inject(&mut self, to: PeerId, from: PeerId, bytes: Bytes) {
        self.feed(to, Event::Received { from, bytes });
    }

    fn feed(&mut self, id: PeerId, event: Event) {
        let now = self.now;
        let actions = match self.nodes.get_mut(&id) {
            Some(node) => node.handle(event, now),
            None => return,
        };
        self.dispatch(id, actions);
    }

    fn dispatch(&mut self, id: PeerId, actions: Vec<Action>) {
        let at = self.elapsed();
        for action in actions {
            match action {
                Action::Transmit { dest, bytes } => {
                    if let Ok(packet) = Packet::from_bytes(&bytes) {
                        self.records.push(Record::Sent {
                            at,
                            from: id,
                            dest,
                            packet,
                        });
                    }
                    self.put_on_medium(id, dest, bytes);
                }
                Action::Deliver { from, buffer } => {
                    self.deliveries.entry(id).or_default().push((from, buffer));
                }
                Action::Outcome {
                    id: submission,
                    outcome,
                } => {
                    self.pending.remove(&(id, submission));
                    self.outcomes
                        .entry(id)
                        .or_default()
                        .push((submission, outcome));
                }
                Action::StateChanged { from, to } => {
                    self.records.push(Record::StateChanged {
                        at,
                        node: id,
                        from,
                        to,
                    });
                }
            }
        }
        self.check_exclusion();
    }

    fn put_on_medium(&mut self, from: PeerId, dest: Option<PeerId>, bytes: Bytes) {
        let receivers: Vec<PeerId> = self
            .nodes
            .keys()
            .copied()
            .filter(|to| dest.map_or(true, |d| d == *to))
            .filter(|to| self.in_range(from, *to))
            .collect();
        let packet = Packet::from_bytes(&bytes).ok();

        for to in receivers {
            if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
                continue;
            }
            if let (Some(filter), Some(packet)) = (self.filter.as_mut(), packet.as_ref()) {
                if filter(from, to, packet) {
                    continue;
                }
            }
            self.sequence += 1;
            self.in_flight.insert(
                (self.now + self.latency, self.sequence),
                Frame {
                    from,
                    to,
                    bytes: bytes.clone(),
                },
            );
        }
    }

    fn check_exclusion(&mut self) {
        let mut claimed: BTreeMap<PeerId, PeerId> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for listener in node.session_listeners() {
                if let Some(other) = claimed.insert(listener, *id) {
                    self.violations.push(format!(
                        "{:?}: listener {} claimed by {} and {}",
                        self.now - self.start,
                        listener,
                        other,
                        id
                    ));
                }
            }
        }
    }

    fn next_event(&self) -> Option<Instant> {
        let frame = self.in_flight.keys().next().map(|(at, _)| *at);
        let timer = self
            .nodes
            .values()
            .filter_map(|node| node.next_deadline())
            .min();
        match (frame, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Process everything due at the next event time, if not after `limit`
    fn step(&mut self, limit: Instant) -> bool {
        let next = match self.next_event() {
            Some(next) if next <= limit => next,
            _ => return false,
        };
        self.now = self.now.max(next);

        while let Some(((at, _), _)) = self.in_flight.first_key_value() {
            if *at > self.now {
                break;
            }
            if let Some((_, frame)) = self.in_flight.pop_first() {
                self.feed(
                    frame.to,
                    Event::Received {
                        from: frame.from,
                        bytes: frame.bytes,
                    },
                );
            }
        }

        let now = self.now;
        for id in self.ids() {
            let due = self.nodes[&id]
                .next_deadline()
                .map_or(false, |deadline| deadline <= now);
            if due {
                self.feed(id, Event::Tick);
            }
        }
        true
    }

    /// Advance virtual time by `duration`
    pub fn run_for(&mut self, duration: Duration) {
        let limit = self.now + duration;
        while self.step(limit) {}
        self.now = self.now.max(limit);
    }

    /// Run until every submission resolved and the medium is quiet
    ///
    /// Returns false if that did not happen within `max` of virtual time.
    pub fn run_until_settled(&mut self, max: Duration) -> bool {
        let limit = self.now + max;
        loop {
            if self.is_settled() {
                return true;
            }
            if !self.step(limit) {
                self.now = self.now.max(limit);
                return self.is_settled();
            }
        }
    }

    fn is_settled(&self) -> bool {
        self.pending.is_empty()
            && self.in_flight.is_empty()
            && self
                .nodes
                .values()
                .all(|node| node.state() == State::Idle && node.queued() == 0)
    }

    pub fn outcomes(&self, id: PeerId) -> &[(SubmissionId, DeliveryOutcome)] {
        self.outcomes.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn outcome_of(&self, id: PeerId, submission: SubmissionId) -> Option<DeliveryOutcome> {
        self.outcomes(id)
            .iter()
            .find(|(s, _)| *s == submission)
            .map(|(_, outcome)| *outcome)
    }

    pub fn deliveries(&self, id: PeerId) -> &[(PeerId, Bytes)] {
        self.deliveries.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Packets sent by `from`, in order
    pub fn sent_by(&self, from: PeerId) -> Vec<(Option<PeerId>, Packet)> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Record::Sent {
                    from: f,
                    dest,
                    packet,
                    ..
                } if *f == from => Some((*dest, packet.clone())),
                _ => None,
            })
            .collect()
    }

    /// State transitions of `node`, in order
    pub fn transitions(&self, node: PeerId) -> Vec<(State, State)> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Record::StateChanged {
                    node: n, from, to, ..
                } if *n == node => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Listeners claimed by two speakers at once
    pub fn violations(&self) -> &[String] {
        &self.violations
    }
}

/// Buffer of `len` bytes with content derived from `seed`
pub fn pattern(seed: u8, len: usize) -> Bytes {
    (0..len)
        .map(|i| seed.wrapping_add(i as u8))
        .collect::<Vec<u8>>()
        .into()
}
