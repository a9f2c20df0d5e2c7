use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::RelayMessage;
use tokio::sync::mpsc;

use crate::error::{BridgeError, BridgeResult};

/// One live connection to a paired device. Concrete implementations live at
/// the edges (the relay's websocket layer, in-process channels in tests);
/// the core only ever pushes framed messages and closes superseded links.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn send(&self, device_id: &str, message: RelayMessage) -> BridgeResult<()>;

    /// Best-effort teardown when a newer connection supersedes this one.
    fn close(&self);
}

/// mpsc-backed transport for tests and in-process wiring.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<RelayMessage>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<RelayMessage>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Convenience for tests: a transport plus the receiving end playing
    /// the device.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceTransport for ChannelTransport {
    async fn send(&self, device_id: &str, message: RelayMessage) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::TransportUnavailable(format!(
                "transport to {} closed",
                device_id
            )));
        }
        self.tx.send(message).map_err(|_| {
            BridgeError::TransportUnavailable(format!("channel to {} dropped", device_id))
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
