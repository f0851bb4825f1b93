//! Winenet CLI Library
//!
//! Shared functionality for the Winenet simulator.

pub mod config;
pub mod stats;

pub use config::{ProtocolConfig, SimConfig, SimConfigError, SimulationConfig};
pub use stats::{display_counters, display_summary, format_bytes, format_elapsed, NodeReport};
