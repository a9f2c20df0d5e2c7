use std::env;
use std::time::Duration;

use bridge_core::BridgeConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sweep_interval_ms: u64,
    pub event_backlog: usize,
    pub max_payload_bytes: usize,
    pub ttl_shell_exec_secs: Option<u64>,
    pub ttl_file_write_secs: Option<u64>,
    pub ttl_file_transfer_secs: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            // The original ShadowBridge dashboard listened on 6767; the CLI
            // pings /api/status there.
            port: env::var("BRIDGE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(6767),
            sweep_interval_ms: env::var("BRIDGE_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            event_backlog: env::var("BRIDGE_EVENT_BACKLOG")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            max_payload_bytes: env::var("BRIDGE_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64 * 1024),
            ttl_shell_exec_secs: env::var("BRIDGE_TTL_SHELL_EXEC")
                .ok()
                .and_then(|v| v.parse().ok()),
            ttl_file_write_secs: env::var("BRIDGE_TTL_FILE_WRITE")
                .ok()
                .and_then(|v| v.parse().ok()),
            ttl_file_transfer_secs: env::var("BRIDGE_TTL_FILE_TRANSFER")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            ttl_shell_exec: self.ttl_shell_exec_secs.map(Duration::from_secs),
            ttl_file_write: self.ttl_file_write_secs.map(Duration::from_secs),
            ttl_file_transfer: self.ttl_file_transfer_secs.map(Duration::from_secs),
            event_backlog: self.event_backlog,
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6767,
            sweep_interval_ms: 1_000,
            event_backlog: 256,
            max_payload_bytes: 64 * 1024,
            ttl_shell_exec_secs: None,
            ttl_file_write_secs: None,
            ttl_file_transfer_secs: None,
        }
    }
}
