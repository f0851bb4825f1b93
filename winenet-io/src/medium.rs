//! In-memory broadcast medium
//!
//! A shared medium connecting any number of stations in one process. Every
//! transmission is heard by the stations in range of the sender; links can
//! be cut and a loss probability applied to model an unreliable channel.
//! Receive callbacks run on the transmitting thread, after the medium lock
//! has been released.

use crate::transceiver::{ReceiveCallback, Transceiver, TransceiverError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use winenet_protocol::PeerId;

/// Medium counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediumStats {
    /// Transmissions accepted
    pub frames_sent: u64,
    /// Copies handed to receivers
    pub frames_delivered: u64,
    /// Copies lost to the loss model
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Station {
    callback: Option<ReceiveCallback>,
}

#[derive(Default)]
struct MediumState {
    stations: BTreeMap<PeerId, Station>,
    /// Cut links, stored with the lower identity first
    cut: BTreeSet<(PeerId, PeerId)>,
    loss: f64,
    stats: MediumStats,
}

impl MediumState {
    fn in_range(&self, a: PeerId, b: PeerId) -> bool {
        a != b && !self.cut.contains(&link(a, b))
    }
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

struct Shared {
    state: RwLock<MediumState>,
    rng: Mutex<StdRng>,
}

/// Shared broadcast medium
#[derive(Clone)]
pub struct Medium {
    shared: Arc<Shared>,
}

impl Default for Medium {
    fn default() -> Self {
        Self::new()
    }
}

impl Medium {
    /// Create a lossless medium
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a medium whose loss draws are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Medium {
            shared: Arc::new(Shared {
                state: RwLock::new(MediumState::default()),
                rng: Mutex::new(rng),
            }),
        }
    }

    /// Attach a station and get its transceiver
    pub fn attach(&self, peer: PeerId) -> MediumPort {
        self.shared
            .state
            .write()
            .stations
            .entry(peer)
            .or_default();
        tracing::debug!("Station {} attached", peer);
        MediumPort {
            peer,
            medium: self.clone(),
        }
    }

    /// Remove a station; its port stops working
    pub fn detach(&self, peer: PeerId) {
        if self.shared.state.write().stations.remove(&peer).is_some() {
            tracing::debug!("Station {} detached", peer);
        }
    }

    /// Bring the link between two stations up or down
    pub fn set_link(&self, a: PeerId, b: PeerId, up: bool) {
        let mut state = self.shared.state.write();
        if up {
            state.cut.remove(&link(a, b));
        } else {
            state.cut.insert(link(a, b));
        }
    }

    /// Probability in `[0, 1]` that a copy of a frame is lost
    pub fn set_loss(&self, probability: f64) {
        self.shared.state.write().loss = probability.clamp(0.0, 1.0);
    }

    /// Check if two stations can hear each other
    pub fn reachable(&self, a: PeerId, b: PeerId) -> bool {
        let state = self.shared.state.read();
        state.stations.contains_key(&a) && state.stations.contains_key(&b) && state.in_range(a, b)
    }

    /// Attached stations
    pub fn stations(&self) -> Vec<PeerId> {
        self.shared.state.read().stations.keys().copied().collect()
    }

    /// Stations in range of `peer`
    pub fn neighbors_of(&self, peer: PeerId) -> Vec<PeerId> {
        let state = self.shared.state.read();
        state
            .stations
            .keys()
            .copied()
            .filter(|other| state.in_range(peer, *other))
            .collect()
    }

    pub fn stats(&self) -> MediumStats {
        self.shared.state.read().stats.clone()
    }

    fn transmit(
        &self,
        from: PeerId,
        dest: Option<PeerId>,
        bytes: Bytes,
    ) -> Result<(), TransceiverError> {
        let receivers: Vec<ReceiveCallback> = {
            let mut state = self.shared.state.write();
            if !state.stations.contains_key(&from) {
                return Err(TransceiverError::Detached);
            }
            if let Some(dest) = dest {
                if !state.stations.contains_key(&dest) {
                    return Err(TransceiverError::UnknownPeer(dest));
                }
            }
            state.stats.frames_sent += 1;

            let loss = state.loss;
            let candidates: Vec<ReceiveCallback> = state
                .stations
                .iter()
                .filter(|(peer, _)| dest.map_or(true, |d| d == **peer))
                .filter(|(peer, _)| state.in_range(from, **peer))
                .filter_map(|(_, station)| station.callback.clone())
                .collect();

            let mut rng = self.shared.rng.lock();
            let mut kept = Vec::with_capacity(candidates.len());
            for callback in candidates {
                if loss > 0.0 && rng.gen_bool(loss) {
                    state.stats.frames_dropped += 1;
                } else {
                    state.stats.frames_delivered += 1;
                    kept.push(callback);
                }
            }
            kept
        };

        for callback in receivers {
            callback(from, bytes.clone());
        }
        Ok(())
    }
}

/// Transceiver of one station on a [`Medium`]
#[derive(Clone)]
pub struct MediumPort {
    peer: PeerId,
    medium: Medium,
}

impl MediumPort {
    /// Medium this port is attached to
    pub fn medium(&self) -> &Medium {
        &self.medium
    }
}

impl Transceiver for MediumPort {
    fn local_id(&self) -> PeerId {
        self.peer
    }

    fn transmit(&self, dest: Option<PeerId>, bytes: Bytes) -> Result<(), TransceiverError> {
        self.medium.transmit(self.peer, dest, bytes)
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        if let Some(station) = self.medium.shared.state.write().stations.get_mut(&self.peer) {
            station.callback = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Inbox = Arc<Mutex<Vec<(PeerId, Bytes)>>>;

    fn listen(port: &MediumPort) -> Inbox {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        port.on_receive(Arc::new(move |from: PeerId, bytes: Bytes| {
            sink.lock().push((from, bytes))
        }));
        inbox
    }

    fn peer(raw: u64) -> PeerId {
        PeerId::new(raw)
    }

    #[test]
    fn test_broadcast_reaches_everyone_else() {
        let medium = Medium::with_seed(1);
        let a = medium.attach(peer(1));
        let b = medium.attach(peer(2));
        let c = medium.attach(peer(3));
        let (inbox_a, inbox_b, inbox_c) = (listen(&a), listen(&b), listen(&c));

        a.transmit(None, Bytes::from_static(b"hi")).unwrap();

        assert!(inbox_a.lock().is_empty());
        assert_eq!(inbox_b.lock().as_slice(), &[(peer(1), Bytes::from_static(b"hi"))]);
        assert_eq!(inbox_c.lock().len(), 1);
        assert_eq!(medium.stats().frames_delivered, 2);
    }

    #[test]
    fn test_unicast_and_cut_links() {
        let medium = Medium::with_seed(1);
        let a = medium.attach(peer(1));
        let b = medium.attach(peer(2));
        let c = medium.attach(peer(3));
        let (inbox_b, inbox_c) = (listen(&b), listen(&c));

        a.transmit(Some(peer(3)), Bytes::from_static(b"x")).unwrap();
        assert!(inbox_b.lock().is_empty());
        assert_eq!(inbox_c.lock().len(), 1);

        medium.set_link(peer(3), peer(1), false);
        assert!(!medium.reachable(peer(1), peer(3)));
        assert_eq!(medium.neighbors_of(peer(1)), vec![peer(2)]);
        a.transmit(None, Bytes::from_static(b"y")).unwrap();
        assert_eq!(inbox_b.lock().len(), 1);
        assert_eq!(inbox_c.lock().len(), 1);

        medium.set_link(peer(1), peer(3), true);
        assert!(medium.reachable(peer(1), peer(3)));
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let medium = Medium::with_seed(1);
        let a = medium.attach(peer(1));
        let b = medium.attach(peer(2));
        let inbox = listen(&b);
        medium.set_loss(1.0);

        for _ in 0..10 {
            a.transmit(None, Bytes::from_static(b"z")).unwrap();
        }
        assert!(inbox.lock().is_empty());
        assert_eq!(medium.stats().frames_dropped, 10);
    }

    proptest::proptest! {
        #[test]
        fn prop_copies_are_accounted(stations in 2u64..8, loss in 0.0f64..1.0, frames in 1usize..20) {
            let medium = Medium::with_seed(stations);
            medium.set_loss(loss);
            let ports: Vec<MediumPort> = (1..=stations).map(|id| medium.attach(peer(id))).collect();
            let inboxes: Vec<Inbox> = ports.iter().map(listen).collect();
            for _ in 0..frames {
                ports[0].transmit(None, Bytes::from_static(b"f")).unwrap();
            }
            let stats = medium.stats();
            let heard: usize = inboxes.iter().map(|inbox| inbox.lock().len()).sum();
            proptest::prop_assert_eq!(stats.frames_sent, frames as u64);
            proptest::prop_assert_eq!(stats.frames_delivered, heard as u64);
            proptest::prop_assert_eq!(
                stats.frames_delivered + stats.frames_dropped,
                frames as u64 * (stations - 1)
            );
        }
    }

    #[test]
    fn test_errors() {
        let medium = Medium::new();
        let a = medium.attach(peer(1));
        assert_eq!(
            a.transmit(Some(peer(9)), Bytes::new()),
            Err(TransceiverError::UnknownPeer(peer(9)))
        );
        medium.detach(peer(1));
        assert_eq!(
            a.transmit(None, Bytes::new()),
            Err(TransceiverError::Detached)
        );
        assert!(medium.stations().is_empty());
        assert_eq!(a.local_id(), peer(1));
    }
}
