//! Winenet tuning parameters

use std::time::Duration;
use thiserror::Error;

/// Protocol configuration, fixed for the lifetime of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinenetConfig {
    /// Number of data packets sent before waiting for a cumulative ACK
    pub frame_size: usize,
    /// Payload bytes carried by each data packet
    pub packet_size: usize,
    /// Retry budget for a frame, a speaker bid and a PING
    pub max_retries: u8,
    /// Time to wait for an ACK before retransmitting
    pub ack_timeout: Duration,
    /// Silence from the paired speaker tolerated by a listener
    pub listener_timeout: Duration,
    /// Seed for tie-break draws; `None` seeds from system entropy
    pub rng_seed: Option<u64>,
}

impl Default for WinenetConfig {
    fn default() -> Self {
        WinenetConfig {
            frame_size: 8,
            packet_size: 1024,
            max_retries: 3,
            ack_timeout: Duration::from_millis(800),
            listener_timeout: Duration::from_millis(2400),
            rng_seed: None,
        }
    }
}

impl WinenetConfig {
    /// Check parameters for values the protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        if self.packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("ack_timeout"));
        }
        if self.listener_timeout < self.ack_timeout {
            return Err(ConfigError::ListenerTimeoutTooShort {
                listener: self.listener_timeout,
                ack: self.ack_timeout,
            });
        }
        Ok(())
    }

    /// Upper bound on how long one frame can stay unacknowledged
    pub fn frame_budget(&self) -> Duration {
        self.ack_timeout * u32::from(self.max_retries)
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Frame size must be at least one packet")]
    ZeroFrameSize,

    #[error("Packet size must be at least one byte")]
    ZeroPacketSize,

    #[error("Retry budget must be at least one")]
    ZeroRetries,

    #[error("Timeout {0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("Listener timeout {listener:?} is shorter than ACK timeout {ack:?}")]
    ListenerTimeoutTooShort { listener: Duration, ack: Duration },
}
