use std::time::Duration;

use crate::request::OperationKind;

/// Core tuning knobs. Binaries build this from their environment config.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Cadence of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Per-kind TTL overrides; `None` uses the kind's default.
    pub ttl_shell_exec: Option<Duration>,
    pub ttl_file_write: Option<Duration>,
    pub ttl_file_transfer: Option<Duration>,
    /// Bounded backlog of the event fan-out channel.
    pub event_backlog: usize,
    pub max_payload_bytes: usize,
}

impl BridgeConfig {
    pub fn ttl_for(&self, kind: OperationKind) -> Duration {
        let override_ttl = match kind {
            OperationKind::ShellExec => self.ttl_shell_exec,
            OperationKind::FileWrite => self.ttl_file_write,
            OperationKind::FileTransfer => self.ttl_file_transfer,
        };
        override_ttl.unwrap_or_else(|| kind.default_ttl())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            ttl_shell_exec: None,
            ttl_file_write: None,
            ttl_file_transfer: None,
            event_backlog: 256,
            max_payload_bytes: 64 * 1024,
        }
    }
}
