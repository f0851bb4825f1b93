//! Winenet - datalink protocol for smart objects on a shared medium
//!
//! High-level API: a threaded [`Node`] driving the protocol state machine
//! over any [`io::Transceiver`].

pub use winenet_io as io;
pub use winenet_protocol as protocol;

pub mod delivery;
pub mod node;

pub use delivery::{Delivery, DeliveryError};
pub use node::{Node, NodeError, NodeSnapshot};

// Re-export commonly used types
pub use protocol::{AbortReason, DeliveryOutcome, PeerId, State, WinenetConfig, WinenetStats};
