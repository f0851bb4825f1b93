//! Transceiver packet envelope
//!
//! Everything Winenet puts on the medium starts with a one-byte packet type.
//! Datalink packets carry a beacon; data packets carry a transID followed by
//! a slice of the buffer being transferred.
//!
//! The transID is a 24-bit packet index within the buffer. Bit 24 marks the
//! final packet of the buffer.

use crate::beacon::{Beacon, DecodeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Highest packet index a buffer can use
pub const WNET_MAX_PACKET_TRANSID: u32 = 0x00FF_FFFF;

/// Flag folded into the transID of the final packet of a buffer
pub const WNET_LAST_PACKET: u32 = 1 << 24;

/// Size of the data packet header (packet type + transID)
pub const DATA_HEADER_SIZE: usize = 1 + 4;

/// Packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Datalink control (a beacon follows)
    Datalink = 0x01,
    /// Buffer data
    Data = 0x02,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Datalink),
            0x02 => Some(PacketType::Data),
            _ => None,
        }
    }
}

/// Data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Raw transID, including the final-packet flag
    pub transid: u32,
    /// Payload data
    pub payload: Bytes,
}

impl DataPacket {
    /// Create a data packet for packet `index` of a buffer
    pub fn new(index: u32, last: bool, payload: Bytes) -> Self {
        let mut transid = index & WNET_MAX_PACKET_TRANSID;
        if last {
            transid |= WNET_LAST_PACKET;
        }
        DataPacket { transid, payload }
    }

    /// Packet index within the buffer
    #[inline]
    pub fn index(&self) -> u32 {
        self.transid & WNET_MAX_PACKET_TRANSID
    }

    /// Check if this is the final packet of the buffer
    #[inline]
    pub fn is_last(&self) -> bool {
        self.transid & WNET_LAST_PACKET != 0
    }
}

/// Unified packet type (beacon or data)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Beacon(Beacon),
    Data(DataPacket),
}

impl Packet {
    /// Total size of the encoded packet
    pub fn size(&self) -> usize {
        match self {
            Packet::Beacon(beacon) => 1 + beacon.size(),
            Packet::Data(data) => DATA_HEADER_SIZE + data.payload.len(),
        }
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        match self {
            Packet::Beacon(beacon) => {
                buf.put_u8(PacketType::Datalink as u8);
                beacon.encode_into(&mut buf);
            }
            Packet::Data(data) => {
                buf.put_u8(PacketType::Data as u8);
                buf.put_u32_le(data.transid);
                buf.put_slice(&data.payload);
            }
        }
        buf.freeze()
    }

    /// Parse a packet from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, rest) = bytes.split_first().ok_or(DecodeError::Truncated {
            needed: 1,
            actual: 0,
        })?;

        match PacketType::from_u8(tag).ok_or(DecodeError::UnknownPacketType(tag))? {
            PacketType::Datalink => Ok(Packet::Beacon(Beacon::from_bytes(rest)?)),
            PacketType::Data => {
                if bytes.len() < DATA_HEADER_SIZE {
                    return Err(DecodeError::Truncated {
                        needed: DATA_HEADER_SIZE,
                        actual: bytes.len(),
                    });
                }
                let mut header = &rest[..4];
                let transid = header.get_u32_le();
                Ok(Packet::Data(DataPacket {
                    transid,
                    payload: Bytes::copy_from_slice(&rest[4..]),
                }))
            }
        }
    }
}

impl From<Beacon> for Packet {
    fn from(beacon: Beacon) -> Self {
        Packet::Beacon(beacon)
    }
}

impl From<DataPacket> for Packet {
    fn from(data: DataPacket) -> Self {
        Packet::Data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Direction;

    #[test]
    fn test_transid_flag() {
        let packet = DataPacket::new(9, true, Bytes::new());
        assert_eq!(packet.transid, 9 | WNET_LAST_PACKET);
        assert_eq!(packet.index(), 9);
        assert!(packet.is_last());

        let packet = DataPacket::new(WNET_MAX_PACKET_TRANSID + 1, false, Bytes::new());
        assert_eq!(packet.index(), 0);
        assert!(!packet.is_last());
    }

    #[test]
    fn test_data_packet_serialization() {
        let payload = Bytes::from_static(b"mobile entity");
        let packet = Packet::Data(DataPacket::new(3, false, payload.clone()));
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(&bytes[1..5], &[3, 0, 0, 0]);

        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Data(data) => {
                assert_eq!(data.index(), 3);
                assert_eq!(data.payload, payload);
            }
            other => panic!("expected data packet, got {:?}", other),
        }
    }

    #[test]
    fn test_beacon_envelope() {
        let packet = Packet::from(Beacon::Ping(Direction::Request));
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..], &[0x01, 0x01, 0, 0]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_malformed_envelopes() {
        assert_eq!(
            Packet::from_bytes(&[]),
            Err(DecodeError::Truncated {
                needed: 1,
                actual: 0
            })
        );
        assert_eq!(
            Packet::from_bytes(&[0x7f, 1, 2]),
            Err(DecodeError::UnknownPacketType(0x7f))
        );
        assert!(matches!(
            Packet::from_bytes(&[0x02, 1, 2]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            Packet::from_bytes(&[0x01, 0x01]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
