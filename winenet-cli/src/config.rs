//! Configuration file support for the Winenet simulator

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use winenet_protocol::WinenetConfig;

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of nodes on the medium
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Buffers each node submits
    #[serde(default = "default_buffers_per_node")]
    pub buffers_per_node: usize,
    /// Size of each submitted buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Probability that one copy of a frame is lost (0.0 to 1.0)
    #[serde(default)]
    pub loss: f64,
    /// Seed for the medium and the tie-break generators
    pub seed: Option<u64>,
    /// Give up on outstanding buffers after this many seconds
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_nodes() -> usize {
    3
}

fn default_buffers_per_node() -> usize {
    2
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_deadline_secs() -> u64 {
    30
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            nodes: default_nodes(),
            buffers_per_node: default_buffers_per_node(),
            buffer_size: default_buffer_size(),
            loss: 0.0,
            seed: None,
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl SimulationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Protocol parameters, with timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_listener_timeout_ms")]
    pub listener_timeout_ms: u64,
}

fn default_frame_size() -> usize {
    WinenetConfig::default().frame_size
}

fn default_packet_size() -> usize {
    WinenetConfig::default().packet_size
}

fn default_max_retries() -> u8 {
    WinenetConfig::default().max_retries
}

fn default_ack_timeout_ms() -> u64 {
    WinenetConfig::default().ack_timeout.as_millis() as u64
}

fn default_listener_timeout_ms() -> u64 {
    WinenetConfig::default().listener_timeout.as_millis() as u64
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            frame_size: default_frame_size(),
            packet_size: default_packet_size(),
            max_retries: default_max_retries(),
            ack_timeout_ms: default_ack_timeout_ms(),
            listener_timeout_ms: default_listener_timeout_ms(),
        }
    }
}

impl ProtocolConfig {
    /// Protocol configuration for one node
    pub fn to_winenet(&self, rng_seed: Option<u64>) -> WinenetConfig {
        WinenetConfig {
            frame_size: self.frame_size,
            packet_size: self.packet_size,
            max_retries: self.max_retries,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            listener_timeout: Duration::from_millis(self.listener_timeout_ms),
            rng_seed,
        }
    }
}

/// Combined simulator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub winenet: ProtocolConfig,
}

impl SimConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SimConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SimConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SimConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SimConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Three nodes, two buffers each, seeded
    pub fn example() -> Self {
        SimConfig {
            simulation: SimulationConfig {
                seed: Some(7),
                ..SimulationConfig::default()
            },
            winenet: ProtocolConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SimConfigError> {
        let sim = &self.simulation;
        if sim.nodes == 0 {
            return Err(SimConfigError::Invalid("nodes must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&sim.loss) {
            return Err(SimConfigError::Invalid(format!(
                "loss must be within 0.0..=1.0, got {}",
                sim.loss
            )));
        }
        if sim.deadline_secs == 0 {
            return Err(SimConfigError::Invalid("deadline_secs must be positive".to_string()));
        }
        self.winenet
            .to_winenet(None)
            .validate()
            .map_err(|e| SimConfigError::Invalid(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum SimConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_is_valid() {
        let config = SimConfig::example();
        assert!(config.validate().is_ok());
        assert_eq!(config.winenet.to_winenet(None), WinenetConfig::default());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = SimConfig::example();
        let toml = config.to_toml().unwrap();
        let parsed: SimConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SimConfig = toml::from_str(
            r#"
            [simulation]
            nodes = 5
            loss = 0.1

            [winenet]
            ack_timeout_ms = 100
            listener_timeout_ms = 300
            "#,
        )
        .unwrap();
        assert_eq!(parsed.simulation.nodes, 5);
        assert_eq!(parsed.simulation.buffers_per_node, 2);
        assert_eq!(parsed.winenet.frame_size, 8);
        let winenet = parsed.winenet.to_winenet(Some(1));
        assert_eq!(winenet.ack_timeout, Duration::from_millis(100));
        assert_eq!(winenet.rng_seed, Some(1));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = SimConfig::example();
        config.simulation.loss = 1.5;
        assert!(matches!(config.validate(), Err(SimConfigError::Invalid(_))));

        let mut config = SimConfig::example();
        config.winenet.frame_size = 0;
        assert!(matches!(config.validate(), Err(SimConfigError::Invalid(_))));
    }
}
