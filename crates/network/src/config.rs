//! Connection configuration
//!
//! Everything a [`crate::PeerConnection`] needs to know about the network it
//! talks to is supplied here at construction time. Durations are written in
//! milliseconds in file form (`request_timeout_ms = 60000`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConnectionError, Result};

/// Length of the network magic marker that starts every frame.
pub const MAGIC_LENGTH: usize = 4;

/// Magic marker of the main network.
pub const MAINNET_MAGIC: [u8; MAGIC_LENGTH] = [0x12, 0x34, 0x56, 0x78];

/// Default peer-to-peer port.
pub const DEFAULT_PORT: u16 = 9084;

/// Per-connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Marker identifying the network every frame belongs to
    pub magic: [u8; MAGIC_LENGTH],
    /// Port dialed for outbound connections
    pub port: u16,
    /// How long `send_request` waits for a correlated response
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// How long the read loop waits for the next frame before giving up on the socket
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Upper bound on a single frame write
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,
    /// Consecutive ping failures tolerated before the peer is reported disconnected
    pub ping_failure_threshold: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            port: DEFAULT_PORT,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_failure_threshold: 3,
        }
    }
}

impl ConnectionConfig {
    /// Reject settings that would make timers fire immediately or never trip.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("connect_timeout", self.connect_timeout),
            ("write_timeout", self.write_timeout),
            ("ping_interval", self.ping_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConnectionError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.ping_failure_threshold == 0 {
            return Err(ConnectionError::InvalidConfig(
                "ping_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
