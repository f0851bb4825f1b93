//! Completion handles for submitted buffers

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use thiserror::Error;
use winenet_protocol::{DeliveryOutcome, SubmissionId};

/// Waiting for an outcome failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Timed out waiting for the delivery outcome")]
    Timeout,

    #[error("Node stopped before the buffer finished")]
    NodeStopped,
}

/// Handle to a buffer submitted to a [`Node`](crate::Node)
///
/// Resolves exactly once, with the outcome the protocol reported.
#[derive(Debug)]
pub struct Delivery {
    id: SubmissionId,
    outcome: Receiver<DeliveryOutcome>,
}

impl Delivery {
    pub(crate) fn new(id: SubmissionId, outcome: Receiver<DeliveryOutcome>) -> Self {
        Delivery { id, outcome }
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Block until the buffer completes or aborts
    pub fn wait(self) -> Result<DeliveryOutcome, DeliveryError> {
        self.outcome.recv().map_err(|_| DeliveryError::NodeStopped)
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<DeliveryOutcome, DeliveryError> {
        self.outcome.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DeliveryError::Timeout,
            RecvTimeoutError::Disconnected => DeliveryError::NodeStopped,
        })
    }

    /// Outcome if already known
    pub fn try_outcome(&self) -> Result<Option<DeliveryOutcome>, DeliveryError> {
        match self.outcome.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(DeliveryError::NodeStopped),
        }
    }
}
