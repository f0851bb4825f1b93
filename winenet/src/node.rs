//! Threaded Winenet node
//!
//! Runs one [`Winenet`] state machine on a dedicated thread. Discovery
//! reports, received frames and submissions arrive over a crossbeam channel;
//! the thread sleeps until the next command or the protocol's next deadline,
//! whichever comes first, and carries out the resulting actions on the
//! transceiver.

use crate::delivery::Delivery;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use winenet_io::Transceiver;
use winenet_protocol::{
    Action, ConfigError, DeliveryOutcome, Event, PeerId, State, SubmissionId, Winenet,
    WinenetConfig, WinenetStats,
};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn node thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Node has stopped")]
    Stopped,
}

/// Point-in-time view of a running node
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub state: State,
    pub paired_speaker: Option<PeerId>,
    /// Buffers waiting for a speaker turn
    pub queued: usize,
    pub valid_neighbors: Vec<PeerId>,
    pub stats: WinenetStats,
}

impl NodeSnapshot {
    fn capture(protocol: &Winenet) -> Self {
        NodeSnapshot {
            state: protocol.state(),
            paired_speaker: protocol.paired_speaker(),
            queued: protocol.queued(),
            valid_neighbors: protocol.neighbors().valid_peers(),
            stats: protocol.stats().clone(),
        }
    }
}

enum Command {
    Joined(PeerId),
    Left(PeerId),
    Inbound {
        from: PeerId,
        bytes: Bytes,
    },
    Submit {
        id: SubmissionId,
        buffer: Bytes,
        reply: Sender<DeliveryOutcome>,
    },
    Shutdown,
}

/// A running Winenet node
pub struct Node {
    id: PeerId,
    commands: Sender<Command>,
    received: Receiver<(PeerId, Bytes)>,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    next_submission: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    /// Start a node on `transceiver`
    ///
    /// The node leaves `Init` right away; peers are added with
    /// [`Node::peer_joined`].
    pub fn spawn<T>(config: WinenetConfig, transceiver: T) -> Result<Self, NodeError>
    where
        T: Transceiver + 'static,
    {
        let id = transceiver.local_id();
        let protocol = Winenet::new(id, config)?;
        let (commands, inbox) = channel::unbounded();
        let (deliver, received) = channel::unbounded();
        let snapshot = Arc::new(RwLock::new(NodeSnapshot::capture(&protocol)));

        let inbound = commands.clone();
        transceiver.on_receive(Arc::new(move |from: PeerId, bytes: Bytes| {
            // The node may already be gone
            let _ = inbound.send(Command::Inbound { from, bytes });
        }));

        let runner = Runner {
            protocol,
            transceiver,
            inbox,
            deliver,
            snapshot: snapshot.clone(),
            pending: HashMap::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("winenet-{}", id))
            .spawn(move || runner.run())?;

        tracing::info!("Node {} started", id);
        Ok(Node {
            id,
            commands,
            received,
            snapshot,
            next_submission: AtomicU64::new(1),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Discovery found `peer`
    pub fn peer_joined(&self, peer: PeerId) -> Result<(), NodeError> {
        self.send(Command::Joined(peer))
    }

    /// Discovery lost `peer`
    pub fn peer_left(&self, peer: PeerId) -> Result<(), NodeError> {
        self.send(Command::Left(peer))
    }

    /// Queue a buffer for broadcast to the neighborhood
    pub fn submit(&self, buffer: Bytes) -> Result<Delivery, NodeError> {
        let id = SubmissionId(self.next_submission.fetch_add(1, Ordering::Relaxed));
        let (reply, outcome) = channel::bounded(1);
        self.send(Command::Submit { id, buffer, reply })?;
        Ok(Delivery::new(id, outcome))
    }

    /// Buffers received from other speakers
    pub fn received(&self) -> &Receiver<(PeerId, Bytes)> {
        &self.received
    }

    /// Wait for the next received buffer
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(PeerId, Bytes)> {
        self.received.recv_timeout(timeout).ok()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> State {
        self.snapshot.read().state
    }

    pub fn stats(&self) -> WinenetStats {
        self.snapshot.read().stats.clone()
    }

    /// Stop the node thread and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Shutdown);
            if thread.join().is_err() {
                tracing::error!("Node {} thread panicked", self.id);
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), NodeError> {
        self.commands.send(command).map_err(|_| NodeError::Stopped)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner<T> {
    protocol: Winenet,
    transceiver: T,
    inbox: Receiver<Command>,
    deliver: Sender<(PeerId, Bytes)>,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    pending: HashMap<SubmissionId, Sender<DeliveryOutcome>>,
}

impl<T: Transceiver> Runner<T> {
    fn run(mut self) {
        let actions = self.protocol.start(Instant::now());
        self.perform(actions);

        loop {
            let command = match self.protocol.next_deadline() {
                Some(deadline) => match self.inbox.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            let event = match command {
                None => Event::Tick,
                Some(Command::Shutdown) => break,
                Some(Command::Joined(peer)) => Event::PeerJoined(peer),
                Some(Command::Left(peer)) => Event::PeerLeft(peer),
                Some(Command::Inbound { from, bytes }) => Event::Received { from, bytes },
                Some(Command::Submit { id, buffer, reply }) => {
                    self.pending.insert(id, reply);
                    Event::Submit { id, buffer }
                }
            };
            let actions = self.protocol.handle(event, Instant::now());
            self.perform(actions);
        }

        // Detach from the medium; pending deliveries resolve as stopped
        self.transceiver.on_receive(Arc::new(|_: PeerId, _: Bytes| {}));
        if !self.pending.is_empty() {
            tracing::warn!(
                "Node {} stopping with {} unfinished buffer(s)",
                self.protocol.own_id(),
                self.pending.len()
            );
        }
        tracing::info!("Node {} stopped", self.protocol.own_id());
    }

    fn perform(&mut self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        for action in actions {
            match action {
                Action::Transmit { dest, bytes } => {
                    if let Err(e) = self.transceiver.transmit(dest, bytes) {
                        tracing::warn!("Node {}: transmit failed: {}", self.protocol.own_id(), e);
                    }
                }
                Action::Deliver { from, buffer } => {
                    let _ = self.deliver.send((from, buffer));
                }
                Action::Outcome { id, outcome } => {
                    if let Some(reply) = self.pending.remove(&id) {
                        let _ = reply.send(outcome);
                    }
                }
                Action::StateChanged { .. } => {}
            }
        }
        *self.snapshot.write() = NodeSnapshot::capture(&self.protocol);
    }
}
