//! Boundary to the transmit/receive primitive
//!
//! Winenet hands opaque byte strings to a transceiver together with a
//! destination identity, and is called back for every byte string heard on
//! the medium. Physical framing and addressing live behind this trait.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use winenet_protocol::PeerId;

/// Callback invoked for every frame received: `(source, bytes)`
pub type ReceiveCallback = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;

/// Transceiver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransceiverError {
    #[error("Transceiver is detached from the medium")]
    Detached,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
}

/// Transmit/receive primitive used by a Winenet node
pub trait Transceiver: Send + Sync {
    /// Identity of the local station
    fn local_id(&self) -> PeerId;

    /// Send bytes to `dest`, or to every station in range when `None`
    fn transmit(&self, dest: Option<PeerId>, bytes: Bytes) -> Result<(), TransceiverError>;

    /// Register the receive callback, replacing any previous one
    fn on_receive(&self, callback: ReceiveCallback);
}

impl<T: Transceiver + ?Sized> Transceiver for Arc<T> {
    fn local_id(&self) -> PeerId {
        (**self).local_id()
    }

    fn transmit(&self, dest: Option<PeerId>, bytes: Bytes) -> Result<(), TransceiverError> {
        (**self).transmit(dest, bytes)
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        (**self).on_receive(callback)
    }
}
