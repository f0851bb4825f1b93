//! Winenet beacon structures and serialization
//!
//! Beacons are the small control messages exchanged between Winenet nodes,
//! distinct from data packets. Every beacon has the same fixed layout:
//!
//! ```text
//! +------+-------+-------------+-----------------+
//! | kind | cause | payload len | payload (LE)    |
//! | u8   | u8    | u8          | payload len × u8|
//! +------+-------+-------------+-----------------+
//! ```
//!
//! Bit 7 of the kind byte separates the request and response halves of the
//! PING and QUERY_STATE exchanges.

use crate::peer::PeerId;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the fixed beacon header (kind, cause, payload length)
pub const BEACON_HEADER_SIZE: usize = 3;

/// Request/response sub-bit of the kind byte
const RESPONSE_FLAG: u8 = 0x80;

/// Size of an encoded [`NeighborState`]
pub const NEIGHBOR_STATE_SIZE: usize = 1 + PeerId::SIZE + 4 + 4;

const STATE_PAIRED: u8 = 0b001;
const STATE_TRANSID: u8 = 0b010;
const STATE_PENDING: u8 = 0b100;

/// Beacon type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BeaconKind {
    /// Neighbour validation handshake
    Ping = 0x01,
    /// Acknowledgement of a beacon or a data frame
    Ack = 0x02,
    /// Speaker claim, or release of bound listeners
    BroadcastSpeaker = 0x04,
    /// Speaker token handed to the next node
    GoSpeaker = 0x08,
    /// Session state query
    QueryState = 0x10,
}

impl BeaconKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(BeaconKind::Ping),
            0x02 => Some(BeaconKind::Ack),
            0x04 => Some(BeaconKind::BroadcastSpeaker),
            0x08 => Some(BeaconKind::GoSpeaker),
            0x10 => Some(BeaconKind::QueryState),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the kind has request and response halves
    fn has_direction(self) -> bool {
        matches!(self, BeaconKind::Ping | BeaconKind::QueryState)
    }
}

/// Half of a two-way exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Status carried by an ACK beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    /// Accepted
    Ok = 0,
    /// The sender gave up waiting
    Timeout = 1,
    /// Refused, or the packet chain broke
    Abort = 2,
}

impl AckStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AckStatus::Ok),
            1 => Some(AckStatus::Timeout),
            2 => Some(AckStatus::Abort),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Cause of a BROADCAST_SPEAKER beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerCause {
    /// The sender wants to become speaker
    Claim,
    /// The sender releases the listeners bound to it
    Release,
}

impl SpeakerCause {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SpeakerCause::Claim),
            2 => Some(SpeakerCause::Release),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SpeakerCause::Claim => 0,
            SpeakerCause::Release => AckStatus::Abort.as_u8(),
        }
    }
}

/// Session state of a node, as reported in a QUERY_STATE response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborState {
    /// Speaker the node is bound to (itself while speaking)
    pub paired_speaker: Option<PeerId>,
    /// transID the node is sending or expecting
    pub in_progress_transid: Option<u32>,
    /// Whether the node has data waiting to be sent
    pub has_pending_packet_data: bool,
    /// Current tie-break value
    pub rand_tiebreak: u32,
}

impl NeighborState {
    fn put(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.paired_speaker.is_some() {
            flags |= STATE_PAIRED;
        }
        if self.in_progress_transid.is_some() {
            flags |= STATE_TRANSID;
        }
        if self.has_pending_packet_data {
            flags |= STATE_PENDING;
        }
        buf.put_u8(flags);
        buf.put_u64_le(self.paired_speaker.map_or(0, PeerId::as_raw));
        buf.put_u32_le(self.in_progress_transid.unwrap_or(0));
        buf.put_u32_le(self.rand_tiebreak);
    }

    fn get(mut buf: &[u8]) -> Self {
        let flags = buf.get_u8();
        let paired = buf.get_u64_le();
        let transid = buf.get_u32_le();
        let rand_tiebreak = buf.get_u32_le();
        NeighborState {
            paired_speaker: (flags & STATE_PAIRED != 0).then(|| PeerId::new(paired)),
            in_progress_transid: (flags & STATE_TRANSID != 0).then_some(transid),
            has_pending_packet_data: flags & STATE_PENDING != 0,
            rand_tiebreak,
        }
    }
}

/// Decoded beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beacon {
    /// PING request or response
    Ping(Direction),
    /// Acknowledgement; `last_transid` is present for data frame ACKs
    Ack {
        status: AckStatus,
        last_transid: Option<u32>,
    },
    /// Speaker claim or release, with the sender's tie-break value
    BroadcastSpeaker {
        cause: SpeakerCause,
        rand_tiebreak: u32,
    },
    /// Speaker token for the addressee
    GoSpeaker,
    /// State query; the response carries the sender's state
    QueryState(Option<NeighborState>),
}

impl Beacon {
    /// Beacon ACK with the given status
    pub fn ack(status: AckStatus) -> Self {
        Beacon::Ack {
            status,
            last_transid: None,
        }
    }

    /// Data frame ACK referencing the frame's highest transID
    pub fn frame_ack(status: AckStatus, last_transid: u32) -> Self {
        Beacon::Ack {
            status,
            last_transid: Some(last_transid),
        }
    }

    /// Get the beacon kind
    pub fn kind(&self) -> BeaconKind {
        match self {
            Beacon::Ping(_) => BeaconKind::Ping,
            Beacon::Ack { .. } => BeaconKind::Ack,
            Beacon::BroadcastSpeaker { .. } => BeaconKind::BroadcastSpeaker,
            Beacon::GoSpeaker => BeaconKind::GoSpeaker,
            Beacon::QueryState(_) => BeaconKind::QueryState,
        }
    }

    fn direction(&self) -> Option<Direction> {
        match self {
            Beacon::Ping(direction) => Some(*direction),
            Beacon::QueryState(None) => Some(Direction::Request),
            Beacon::QueryState(Some(_)) => Some(Direction::Response),
            _ => None,
        }
    }

    fn cause(&self) -> u8 {
        match self {
            Beacon::Ack { status, .. } => status.as_u8(),
            Beacon::BroadcastSpeaker { cause, .. } => cause.as_u8(),
            _ => 0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Beacon::Ack {
                last_transid: Some(_),
                ..
            } => 4,
            Beacon::BroadcastSpeaker { .. } => 4,
            Beacon::QueryState(Some(_)) => NEIGHBOR_STATE_SIZE,
            _ => 0,
        }
    }

    /// Total encoded size (header + payload)
    pub fn size(&self) -> usize {
        BEACON_HEADER_SIZE + self.payload_len()
    }

    /// Serialize the beacon into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut kind = self.kind().as_u8();
        if self.direction() == Some(Direction::Response) {
            kind |= RESPONSE_FLAG;
        }
        buf.reserve(self.size());
        buf.put_u8(kind);
        buf.put_u8(self.cause());
        buf.put_u8(self.payload_len() as u8);

        match self {
            Beacon::Ack {
                last_transid: Some(transid),
                ..
            } => buf.put_u32_le(*transid),
            Beacon::BroadcastSpeaker { rand_tiebreak, .. } => buf.put_u32_le(*rand_tiebreak),
            Beacon::QueryState(Some(state)) => state.put(buf),
            _ => {}
        }
    }

    /// Serialize the beacon to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse a beacon from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < BEACON_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: BEACON_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let raw_kind = bytes[0];
        let kind = BeaconKind::from_u8(raw_kind & !RESPONSE_FLAG)
            .ok_or(DecodeError::UnknownKind(raw_kind))?;
        let direction = if raw_kind & RESPONSE_FLAG != 0 {
            if !kind.has_direction() {
                return Err(DecodeError::UnknownKind(raw_kind));
            }
            Direction::Response
        } else {
            Direction::Request
        };
        let cause = bytes[1];
        let payload_len = bytes[2] as usize;

        let end = BEACON_HEADER_SIZE + payload_len;
        if bytes.len() < end {
            return Err(DecodeError::Truncated {
                needed: end,
                actual: bytes.len(),
            });
        }
        let payload = &bytes[BEACON_HEADER_SIZE..end];

        let need = |min: usize| {
            if payload.len() < min {
                Err(DecodeError::Truncated {
                    needed: BEACON_HEADER_SIZE + min,
                    actual: end,
                })
            } else {
                Ok(())
            }
        };

        match kind {
            BeaconKind::Ping => Ok(Beacon::Ping(direction)),
            BeaconKind::Ack => {
                let status = AckStatus::from_u8(cause).ok_or(DecodeError::InvalidCause(cause))?;
                let last_transid = if payload.is_empty() {
                    None
                } else {
                    need(4)?;
                    Some((&payload[..4]).get_u32_le())
                };
                Ok(Beacon::Ack {
                    status,
                    last_transid,
                })
            }
            BeaconKind::BroadcastSpeaker => {
                let cause =
                    SpeakerCause::from_u8(cause).ok_or(DecodeError::InvalidCause(cause))?;
                need(4)?;
                Ok(Beacon::BroadcastSpeaker {
                    cause,
                    rand_tiebreak: (&payload[..4]).get_u32_le(),
                })
            }
            BeaconKind::GoSpeaker => Ok(Beacon::GoSpeaker),
            BeaconKind::QueryState => match direction {
                Direction::Request => Ok(Beacon::QueryState(None)),
                Direction::Response => {
                    need(NEIGHBOR_STATE_SIZE)?;
                    Ok(Beacon::QueryState(Some(NeighborState::get(
                        &payload[..NEIGHBOR_STATE_SIZE],
                    ))))
                }
            },
        }
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Beacon::Ping(direction) => write!(f, "PING({:?})", direction),
            Beacon::Ack {
                status,
                last_transid: Some(transid),
            } => write!(f, "ACK({:?}, transid={})", status, transid),
            Beacon::Ack { status, .. } => write!(f, "ACK({:?})", status),
            Beacon::BroadcastSpeaker {
                cause,
                rand_tiebreak,
            } => write!(f, "BROADCAST_SPEAKER({:?}, rand={})", cause, rand_tiebreak),
            Beacon::GoSpeaker => write!(f, "GO_SPEAKER"),
            Beacon::QueryState(None) => write!(f, "QUERY_STATE(Request)"),
            Beacon::QueryState(Some(_)) => write!(f, "QUERY_STATE(Response)"),
        }
    }
}

/// Beacon and packet parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unknown beacon kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Invalid beacon cause: {0}")]
    InvalidCause(u8),

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_layout() {
        let bytes = Beacon::Ping(Direction::Request).to_bytes();
        assert_eq!(&bytes[..], &[0x01, 0, 0]);

        let bytes = Beacon::Ping(Direction::Response).to_bytes();
        assert_eq!(&bytes[..], &[0x81, 0, 0]);
        assert_eq!(
            Beacon::from_bytes(&bytes).unwrap(),
            Beacon::Ping(Direction::Response)
        );
    }

    #[test]
    fn test_frame_ack_layout() {
        let beacon = Beacon::frame_ack(AckStatus::Ok, 0x0102_0304);
        let bytes = beacon.to_bytes();
        assert_eq!(&bytes[..], &[0x02, 0, 4, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Beacon::from_bytes(&bytes).unwrap(), beacon);
    }

    #[test]
    fn test_beacon_ack_has_no_transid() {
        let bytes = Beacon::ack(AckStatus::Abort).to_bytes();
        assert_eq!(&bytes[..], &[0x02, 2, 0]);
        assert_eq!(
            Beacon::from_bytes(&bytes).unwrap(),
            Beacon::Ack {
                status: AckStatus::Abort,
                last_transid: None
            }
        );
    }

    #[test]
    fn test_broadcast_speaker_release() {
        let beacon = Beacon::BroadcastSpeaker {
            cause: SpeakerCause::Release,
            rand_tiebreak: 99,
        };
        let bytes = beacon.to_bytes();
        assert_eq!(bytes[1], 2);
        assert_eq!(Beacon::from_bytes(&bytes).unwrap(), beacon);
    }

    #[test]
    fn test_query_state_response() {
        let state = NeighborState {
            paired_speaker: Some(PeerId::new(0xDEAD_BEEF)),
            in_progress_transid: None,
            has_pending_packet_data: true,
            rand_tiebreak: 12345,
        };
        let beacon = Beacon::QueryState(Some(state));
        let bytes = beacon.to_bytes();
        assert_eq!(bytes.len(), BEACON_HEADER_SIZE + NEIGHBOR_STATE_SIZE);
        assert_eq!(bytes[0], 0x90);
        assert_eq!(Beacon::from_bytes(&bytes).unwrap(), beacon);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            Beacon::from_bytes(&[0x01]),
            Err(DecodeError::Truncated {
                needed: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn test_truncated_payload() {
        // Declared payload longer than the input
        assert_eq!(
            Beacon::from_bytes(&[0x04, 0, 4, 1, 2]),
            Err(DecodeError::Truncated {
                needed: 7,
                actual: 5
            })
        );
        // Payload shorter than the kind's minimum
        assert_eq!(
            Beacon::from_bytes(&[0x04, 0, 2, 1, 2]),
            Err(DecodeError::Truncated {
                needed: 7,
                actual: 5
            })
        );
        assert!(matches!(
            Beacon::from_bytes(&[0x90, 0, 0]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            Beacon::from_bytes(&[0x20, 0, 0]),
            Err(DecodeError::UnknownKind(0x20))
        );
        // Response bit is only legal on PING and QUERY_STATE
        assert_eq!(
            Beacon::from_bytes(&[0x88, 0, 0]),
            Err(DecodeError::UnknownKind(0x88))
        );
    }

    #[test]
    fn test_invalid_cause() {
        assert_eq!(
            Beacon::from_bytes(&[0x02, 7, 0]),
            Err(DecodeError::InvalidCause(7))
        );
        assert_eq!(
            Beacon::from_bytes(&[0x04, 1, 4, 0, 0, 0, 0]),
            Err(DecodeError::InvalidCause(1))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Beacon::GoSpeaker.to_string(), "GO_SPEAKER");
        assert_eq!(
            Beacon::frame_ack(AckStatus::Ok, 3).to_string(),
            "ACK(Ok, transid=3)"
        );
    }
}
