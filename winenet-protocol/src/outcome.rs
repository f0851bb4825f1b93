//! Delivery results reported to the upper layer

use std::fmt;

/// Identifier the caller attaches to a submitted buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a delivery was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No listener acknowledged within the retry budget
    NoAck,
    /// No validated neighbor could receive the buffer
    NoNeighbors,
    /// Every listener left during the transfer
    PeerLost,
    /// The buffer needs more packets than a transID can number
    Oversized,
}

/// Final result of a submitted buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every remaining listener acknowledged the whole buffer
    Completed,
    /// The buffer was not delivered
    Aborted(AbortReason),
}

impl DeliveryOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DeliveryOutcome::Completed)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Completed => write!(f, "completed"),
            DeliveryOutcome::Aborted(reason) => write!(f, "aborted ({:?})", reason),
        }
    }
}
