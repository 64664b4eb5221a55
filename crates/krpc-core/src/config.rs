//! Centralized configuration for the kRPC engine.
//!
//! Protocol constants live in unit structs with associated consts; the
//! tunable server settings are a serde-loadable [`ServerConfig`].

use crate::{KrpcError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Magic header opening an RPC hello.
    pub const RPC_HELLO_HEADER: [u8; 8] = [0x48, 0x45, 0x4C, 0x4C, 0x4F, 0xBA, 0xDA, 0x55];
    /// Magic header opening a Stream hello (`HELLO-STREAM`).
    pub const STREAM_HELLO_HEADER: [u8; 12] = *b"HELLO-STREAM";
    /// Zero-padded UTF-8 client name following the RPC header.
    pub const CLIENT_NAME_LENGTH: usize = 32;
    /// Client guid following the Stream header.
    pub const CLIENT_IDENTIFIER_LENGTH: usize = 16;
    /// Reply written to a stream client once its connection is allowed.
    pub const STREAM_OK_MESSAGE: [u8; 2] = *b"OK";
    /// A client that has not completed its hello by then is denied.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
    /// Per-client receive buffer; a request larger than this is malformed.
    pub const REQUEST_BUFFER_SIZE: usize = 1024 * 1024;
    /// Chunk size the TCP transport reads from a socket.
    pub const READ_CHUNK_SIZE: usize = 4096;
    /// Version reported by `KRPC.GetStatus`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
}

/// Adaptive rate control tuning.
pub struct RateControlConfig;

impl RateControlConfig {
    /// Target host frame rate; slightly under 60 so the loop pushes against it.
    pub const TARGET_FRAME_RATE: u32 = 59;
    pub const STEP_US: u32 = 100;
    pub const MIN_TIME_PER_UPDATE_US: u32 = 1_000;
    pub const MAX_TIME_PER_UPDATE_US: u32 = 25_000;
    /// Budget restored when almost no time was spent executing.
    pub const IDLE_TIME_PER_UPDATE_US: u32 = 10_000;
    pub const IDLE_EXEC_THRESHOLD: Duration = Duration::from_millis(1);

    pub fn target_frame_time() -> Duration {
        Duration::from_secs(1) / Self::TARGET_FRAME_RATE
    }
}

/// Statistics smoothing.
pub struct StatsConfig;

impl StatsConfig {
    pub const MOVING_AVERAGE_ALPHA: f32 = 0.25;
}

/// Settings for the request loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Wall-clock budget for polling and executing RPCs per tick, in microseconds.
    pub max_time_per_update_us: u32,
    /// Retune `max_time_per_update_us` after every tick.
    pub adaptive_rate_control: bool,
    /// Stop after a single pass over the clients each tick.
    pub one_rpc_per_update: bool,
    /// Keep polling for new data (up to `recv_timeout_us`) on idle ticks.
    pub blocking_recv: bool,
    pub recv_timeout_us: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_time_per_update_us: 5_000,
            adaptive_rate_control: true,
            one_rpc_per_update: false,
            blocking_recv: true,
            recv_timeout_us: 1_000,
        }
    }
}

impl UpdateConfig {
    pub fn max_time_per_update(&self) -> Duration {
        Duration::from_micros(u64::from(self.max_time_per_update_us))
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_micros(u64::from(self.recv_timeout_us))
    }
}

/// Server configuration, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub rpc_port: u16,
    pub stream_port: u16,
    pub update: UpdateConfig,
    /// Include the procedure name in error Responses.
    pub verbose_errors: bool,
    /// Omit stream results that are byte-identical to the last one sent.
    pub stream_only_changes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            rpc_port: 50000,
            stream_port: 50001,
            update: UpdateConfig::default(),
            verbose_errors: false,
            stream_only_changes: false,
        }
    }
}

impl ServerConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| KrpcError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let config: ServerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let budget = self.update.max_time_per_update_us;
        if budget == 0 {
            return Err(KrpcError::Config {
                message: "max_time_per_update_us must be greater than zero".to_string(),
            });
        }
        if self.update.adaptive_rate_control && budget > RateControlConfig::MAX_TIME_PER_UPDATE_US
        {
            return Err(KrpcError::Config {
                message: format!(
                    "max_time_per_update_us {} exceeds the adaptive ceiling {}",
                    budget,
                    RateControlConfig::MAX_TIME_PER_UPDATE_US
                ),
            });
        }
        if self.rpc_port != 0 && self.rpc_port == self.stream_port {
            return Err(KrpcError::Config {
                message: format!("rpc_port and stream_port are both {}", self.rpc_port),
            });
        }
        Ok(())
    }
}
