//! Transceiver abstraction and an in-memory broadcast medium for Winenet

pub mod medium;
pub mod transceiver;

pub use medium::{Medium, MediumPort, MediumStats};
pub use transceiver::{ReceiveCallback, Transceiver, TransceiverError};
