//! Client configuration knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable timeouts and limits for a Conclave client.
///
/// The reconnect backoff curve is protocol policy, not configuration; see
/// `conclave::manager::backoff_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deadline for establishing the TCP connection.
    pub connect_timeout_ms: u64,
    /// Grace period added to the server heartbeat interval before the
    /// watchdog declares the link dead.
    pub heartbeat_slack_ms: u64,
    /// Upper bound on a single undelimited frame before the connection is
    /// torn down.
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            heartbeat_slack_ms: 30_000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_slack(&self) -> Duration {
        Duration::from_millis(self.heartbeat_slack_ms)
    }
}
