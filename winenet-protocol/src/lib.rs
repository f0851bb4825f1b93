//! Winenet datalink protocol core
//!
//! This crate implements the Winenet protocol used by smart objects sharing
//! one broadcast medium: beacon encoding, the neighbor table, speaker
//! election, windowed reliable delivery and the state machine tying them
//! together. It performs no I/O; see the `winenet` crate for a threaded
//! runtime.

pub mod beacon;
pub mod config;
pub mod election;
pub mod fsm;
pub mod neighbor;
pub mod outcome;
pub mod packet;
pub mod peer;
pub mod reliability;
pub mod timer;

pub use beacon::{
    AckStatus, Beacon, BeaconKind, DecodeError, Direction, NeighborState, SpeakerCause,
};
pub use config::{ConfigError, WinenetConfig};
pub use election::{Candidate, ElectionConflict, Resolution};
pub use fsm::{Action, Event, State, Winenet, WinenetStats};
pub use neighbor::{NeighborEntry, NeighborEvent, NeighborTable};
pub use outcome::{AbortReason, DeliveryOutcome, SubmissionId};
pub use packet::{DataPacket, Packet, WNET_LAST_PACKET, WNET_MAX_PACKET_TRANSID};
pub use peer::PeerId;
pub use reliability::{ReliabilityError, RxSession, TxSession};
