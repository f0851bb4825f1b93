//! Windowed send/ACK/retry between a speaker and its listeners
//!
//! The speaker cuts a buffer into fixed-size packets and sends them in
//! frames of `frame_size` packets. After each frame it waits for a
//! cumulative ACK naming the frame's highest transID from every listener.
//! A frame that is not fully acknowledged in time is retransmitted whole.
//!
//! The listener accepts packets strictly in order, acknowledges each
//! completed frame and hands the buffer upward once the final packet
//! arrived.

use crate::beacon::{AckStatus, Beacon};
use crate::config::WinenetConfig;
use crate::outcome::AbortReason;
use crate::packet::{DataPacket, WNET_MAX_PACKET_TRANSID};
use crate::peer::PeerId;
use crate::timer::Timer;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Maximum number of packets in one buffer
pub const MAX_PACKETS_PER_BUFFER: usize = WNET_MAX_PACKET_TRANSID as usize + 1;

/// Reliability errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityError {
    #[error("Buffer needs {packets} packets (max {max})")]
    BufferTooLarge { packets: usize, max: usize },

    #[error("Session has no listener")]
    NoListeners,
}

/// Number of packets a buffer of `len` bytes is cut into
///
/// An empty buffer still travels as one empty final packet.
pub fn packet_count(len: usize, packet_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        (len + packet_size - 1) / packet_size
    }
}

/// Outcome of a speaker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Completed,
    Aborted(AbortReason),
}

/// What the speaker must do after feeding the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxProgress {
    /// Nothing to send yet
    Waiting,
    /// Send these packets
    Transmit {
        packets: Vec<DataPacket>,
        retransmission: bool,
    },
    /// Every packet acknowledged
    Completed,
    /// The session gave up
    Aborted(AbortReason),
}

/// Speaker side of a buffer transfer
#[derive(Debug)]
pub struct TxSession {
    /// Buffer cut into packets
    packets: Vec<Bytes>,
    /// Packets per frame
    frame_size: usize,
    /// Index of the first packet of the current frame
    transid_cursor: usize,
    /// Number of the current frame
    frame_cursor: usize,
    /// Retry budget per frame
    max_retries: u8,
    /// Retries left for the current frame
    retries_left: u8,
    /// Listeners still in the session, and whether they ACKed the frame
    listeners: BTreeMap<PeerId, bool>,
    /// Listeners dropped for staying silent
    dropped: Vec<PeerId>,
    /// Frame ACK timer
    timer: Timer,
    /// The current attempt was already resent for a broken chain
    chain_break_resent: bool,
    outcome: TxState,
    /// Data packets sent again
    retransmissions: u64,
}

impl TxSession {
    /// Create a session sending `buffer` to `listeners`
    pub fn new(
        buffer: Bytes,
        listeners: impl IntoIterator<Item = PeerId>,
        config: &WinenetConfig,
    ) -> Result<Self, ReliabilityError> {
        let count = packet_count(buffer.len(), config.packet_size);
        if count > MAX_PACKETS_PER_BUFFER {
            return Err(ReliabilityError::BufferTooLarge {
                packets: count,
                max: MAX_PACKETS_PER_BUFFER,
            });
        }

        let listeners: BTreeMap<PeerId, bool> =
            listeners.into_iter().map(|peer| (peer, false)).collect();
        if listeners.is_empty() {
            return Err(ReliabilityError::NoListeners);
        }

        let packets = if buffer.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..count)
                .map(|i| {
                    let start = i * config.packet_size;
                    let end = (start + config.packet_size).min(buffer.len());
                    buffer.slice(start..end)
                })
                .collect()
        };

        Ok(TxSession {
            packets,
            frame_size: config.frame_size,
            transid_cursor: 0,
            frame_cursor: 0,
            max_retries: config.max_retries,
            retries_left: config.max_retries,
            listeners,
            dropped: Vec::new(),
            timer: Timer::new(config.ack_timeout),
            chain_break_resent: false,
            outcome: TxState::Pending,
            retransmissions: 0,
        })
    }

    /// Emit the first frame and arm the ACK timer
    pub fn start(&mut self, now: Instant) -> Vec<DataPacket> {
        self.timer.arm(now);
        self.frame_packets()
    }

    /// Feed an ACK from a listener
    pub fn on_ack(
        &mut self,
        from: PeerId,
        status: AckStatus,
        last_transid: u32,
        now: Instant,
    ) -> TxProgress {
        if self.outcome != TxState::Pending || !self.listeners.contains_key(&from) {
            return TxProgress::Waiting;
        }

        let index = (last_transid & WNET_MAX_PACKET_TRANSID) as usize;
        match status {
            AckStatus::Ok => {
                if index != self.frame_last() {
                    // Stale or duplicate
                    return TxProgress::Waiting;
                }
                self.listeners.insert(from, true);
                if self.listeners.values().all(|acked| *acked) {
                    self.advance(now)
                } else {
                    TxProgress::Waiting
                }
            }
            AckStatus::Timeout | AckStatus::Abort => {
                if index < self.transid_cursor || index > self.frame_last() {
                    return TxProgress::Waiting;
                }
                if self.chain_break_resent {
                    // Every listener that lost a packet of one attempt reports
                    // it; a single resend answers them all
                    return TxProgress::Waiting;
                }
                self.chain_break_resent = true;
                tracing::debug!(
                    "Listener {} broke the chain at transid {}, resending frame {}",
                    from,
                    index,
                    self.frame_cursor
                );
                self.retry(now)
            }
        }
    }

    /// Handle the frame ACK timer
    pub fn on_timeout(&mut self, now: Instant) -> TxProgress {
        if self.outcome != TxState::Pending || !self.timer.try_fire(now) {
            return TxProgress::Waiting;
        }
        tracing::debug!(
            "Frame {} unacknowledged, {} retries left",
            self.frame_cursor,
            self.retries_left.saturating_sub(1)
        );
        self.chain_break_resent = false;
        self.retry(now)
    }

    /// Drop a listener that left the neighborhood
    pub fn remove_listener(&mut self, peer: PeerId, now: Instant) -> TxProgress {
        if self.outcome != TxState::Pending || self.listeners.remove(&peer).is_none() {
            return TxProgress::Waiting;
        }
        if self.listeners.is_empty() {
            return self.abort(AbortReason::PeerLost);
        }
        if self.listeners.values().all(|acked| *acked) {
            self.advance(now)
        } else {
            TxProgress::Waiting
        }
    }

    fn retry(&mut self, now: Instant) -> TxProgress {
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left > 0 {
            self.timer.arm(now);
            let packets = self.frame_packets();
            self.retransmissions += packets.len() as u64;
            return TxProgress::Transmit {
                packets,
                retransmission: true,
            };
        }

        let silent: Vec<PeerId> = self
            .listeners
            .iter()
            .filter(|(_, acked)| !**acked)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in silent {
            tracing::warn!(
                "Listener {} never acknowledged frame {}, dropping it",
                peer,
                self.frame_cursor
            );
            self.listeners.remove(&peer);
            self.dropped.push(peer);
        }

        if self.listeners.is_empty() {
            self.abort(AbortReason::NoAck)
        } else {
            self.advance(now)
        }
    }

    fn advance(&mut self, now: Instant) -> TxProgress {
        self.transid_cursor = self.frame_end();
        self.frame_cursor += 1;
        self.retries_left = self.max_retries;
        self.chain_break_resent = false;
        for acked in self.listeners.values_mut() {
            *acked = false;
        }

        if self.transid_cursor >= self.packets.len() {
            self.timer.cancel();
            self.outcome = TxState::Completed;
            return TxProgress::Completed;
        }

        self.timer.arm(now);
        TxProgress::Transmit {
            packets: self.frame_packets(),
            retransmission: false,
        }
    }

    fn abort(&mut self, reason: AbortReason) -> TxProgress {
        self.timer.cancel();
        self.outcome = TxState::Aborted(reason);
        TxProgress::Aborted(reason)
    }

    fn frame_end(&self) -> usize {
        (self.transid_cursor + self.frame_size).min(self.packets.len())
    }

    fn frame_last(&self) -> usize {
        self.frame_end() - 1
    }

    fn frame_packets(&self) -> Vec<DataPacket> {
        let total = self.packets.len();
        (self.transid_cursor..self.frame_end())
            .map(|i| DataPacket::new(i as u32, i + 1 == total, self.packets[i].clone()))
            .collect()
    }

    /// Index of the first packet of the current frame
    pub fn transid_cursor(&self) -> usize {
        self.transid_cursor
    }

    /// Number of the current frame
    pub fn frame_cursor(&self) -> usize {
        self.frame_cursor
    }

    /// Retries left for the current frame
    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn frame_count(&self) -> usize {
        (self.packets.len() + self.frame_size - 1) / self.frame_size
    }

    pub fn outcome(&self) -> TxState {
        self.outcome
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Listeners still in the session
    pub fn listeners(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.listeners.keys().copied()
    }

    /// Listeners dropped for staying silent
    pub fn dropped(&self) -> &[PeerId] {
        &self.dropped
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}

/// What a listener produced from one data packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxOutcome {
    /// ACK to send back to the speaker
    pub ack: Option<Beacon>,
    /// Completed buffer to hand upward
    pub delivered: Option<Bytes>,
}

/// Listener side of a buffer transfer
#[derive(Debug)]
pub struct RxSession {
    paired_speaker: PeerId,
    frame_size: u32,
    /// Next in-order packet index
    next: u32,
    /// Packets of the frame in progress
    frame: Vec<Bytes>,
    /// Completed frames
    assembled: BytesMut,
    /// An Abort ACK was sent for the current frame attempt
    abort_sent: bool,
    /// Index of the final packet once the buffer was delivered
    completed: Option<u32>,
    watchdog: Timer,
}

impl RxSession {
    /// Bind to `speaker` and arm the listener watchdog
    pub fn new(
        speaker: PeerId,
        frame_size: usize,
        listener_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut watchdog = Timer::new(listener_timeout);
        watchdog.arm(now);
        RxSession {
            paired_speaker: speaker,
            frame_size: frame_size as u32,
            next: 0,
            frame: Vec::new(),
            assembled: BytesMut::new(),
            abort_sent: false,
            completed: None,
            watchdog,
        }
    }

    pub fn paired_speaker(&self) -> PeerId {
        self.paired_speaker
    }

    /// Last packet index accepted in order
    pub fn last_inorder_transid(&self) -> Option<u32> {
        self.next.checked_sub(1)
    }

    /// Next packet index expected
    pub fn expected(&self) -> u32 {
        self.next
    }

    /// Check if the buffer was already delivered
    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// Bytes held that were not delivered yet
    pub fn partial_len(&self) -> usize {
        self.assembled.len() + self.frame.iter().map(Bytes::len).sum::<usize>()
    }

    /// Re-arm the watchdog on traffic from the speaker
    pub fn touch(&mut self, now: Instant) {
        self.watchdog.arm(now);
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.watchdog.expired(now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.deadline()
    }

    /// Feed a data packet from the paired speaker
    pub fn on_packet(&mut self, packet: &DataPacket, now: Instant) -> RxOutcome {
        self.touch(now);

        let index = packet.index();
        let last = packet.is_last();
        let frame_end = last || index % self.frame_size == self.frame_size - 1;
        let mut outcome = RxOutcome::default();

        if let Some(final_index) = self.completed {
            if index <= final_index && frame_end {
                outcome.ack = Some(Beacon::frame_ack(AckStatus::Ok, index));
            }
            return outcome;
        }

        let frame_start = self.next - self.next % self.frame_size;

        if index == frame_start {
            // First packet of the frame, possibly a retransmission
            self.frame.clear();
            self.next = frame_start;
            self.abort_sent = false;
        }

        if index == self.next {
            self.frame.push(packet.payload.clone());
            self.next += 1;
            if frame_end {
                for payload in self.frame.drain(..) {
                    self.assembled.extend_from_slice(&payload);
                }
                outcome.ack = Some(Beacon::frame_ack(AckStatus::Ok, index));
                if last {
                    self.completed = Some(index);
                    outcome.delivered = Some(self.assembled.split().freeze());
                }
            }
        } else if index < frame_start {
            // Frame already acknowledged; our ACK was lost
            if frame_end {
                outcome.ack = Some(Beacon::frame_ack(AckStatus::Ok, index));
            }
        } else if index > self.next {
            tracing::debug!(
                "Packet chain broken from {}: expected {}, got {}",
                self.paired_speaker,
                self.next,
                index
            );
            self.frame.clear();
            self.next = frame_start;
            if !self.abort_sent {
                self.abort_sent = true;
                outcome.ack = Some(Beacon::frame_ack(AckStatus::Abort, index));
            }
        }
        // Packets between the frame start and `next` repeat what we hold

        outcome
    }
}
