use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use bridge_core::{ChannelTransport, DeviceTransport};
use bridge_proto::{DeviceMessage, RelayMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::handlers::SharedCoordinator;
use crate::pairing;

/// WebSocket upgrade for a device connection. The path device id must match
/// the `hello` frame's claimed identity.
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(coordinator): State<SharedCoordinator>,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, device_id, coordinator))
}

async fn handle_device_socket(socket: WebSocket, device_id: String, coordinator: SharedCoordinator) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayMessage>();

    // Pump task: channel -> socket. The coordinator pushes into the channel
    // through the transport seam and never touches the socket directly.
    let pump_device = device_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(device = %pump_device, "socket pump ended");
    });

    // The first frame must be a hello carrying the pairing fingerprint.
    let transport = match expect_hello(&mut receiver, &device_id, &coordinator, &tx).await {
        Some(tx_transport) => tx_transport,
        None => return,
    };

    let transport_dyn: Arc<dyn DeviceTransport> = transport.clone();
    if let Err(err) = coordinator.attach_device(&device_id, transport_dyn.clone()).await {
        error!(device = %device_id, %err, "attach failed");
        let _ = tx.send(RelayMessage::Error {
            message: err.to_string(),
        });
        return;
    }
    let _ = tx.send(RelayMessage::HelloAck {
        device_id: device_id.clone(),
    });
    info!(device = %device_id, "device connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(device = %device_id, %err, "websocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<DeviceMessage>(&text) {
                Ok(message) => {
                    handle_device_message(message, &device_id, &coordinator, &tx).await;
                }
                Err(err) => {
                    warn!(device = %device_id, %err, "unparseable device frame");
                    let _ = tx.send(RelayMessage::Error {
                        message: format!("invalid message format: {}", err),
                    });
                }
            },
            Message::Close(_) => {
                debug!(device = %device_id, "close frame received");
                break;
            }
            // Axum answers protocol pings itself.
            _ => {}
        }
    }

    // A superseded connection must not knock out its replacement.
    match coordinator
        .detach_device_transport(&device_id, &transport_dyn)
        .await
    {
        Ok(true) => info!(device = %device_id, "device disconnected"),
        Ok(false) => debug!(device = %device_id, "stale connection cleaned up"),
        Err(err) => debug!(device = %device_id, %err, "detach skipped"),
    }
}

/// Reads frames until a valid `hello` arrives; anything else closes the
/// connection. Returns the transport to install.
async fn expect_hello(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    device_id: &str,
    coordinator: &SharedCoordinator,
    tx: &mpsc::UnboundedSender<RelayMessage>,
) -> Option<Arc<ChannelTransport>> {
    while let Some(frame) = receiver.next().await {
        let frame = frame.ok()?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        return match serde_json::from_str::<DeviceMessage>(&text) {
            Ok(DeviceMessage::Hello {
                device_id: claimed,
                fingerprint,
            }) => {
                if claimed != device_id {
                    let _ = tx.send(RelayMessage::Error {
                        message: "hello device id does not match connection path".into(),
                    });
                    return None;
                }
                let device = match coordinator.registry().get(device_id) {
                    Ok(device) => device,
                    Err(err) => {
                        let _ = tx.send(RelayMessage::Error {
                            message: err.to_string(),
                        });
                        return None;
                    }
                };
                if !pairing::verify_fingerprint(&fingerprint, &device.fingerprint) {
                    warn!(device = %device_id, "fingerprint mismatch on hello");
                    let _ = tx.send(RelayMessage::Error {
                        message: "fingerprint mismatch".into(),
                    });
                    return None;
                }
                Some(ChannelTransport::new(tx.clone()))
            }
            Ok(_) => {
                let _ = tx.send(RelayMessage::Error {
                    message: "expected hello as first message".into(),
                });
                None
            }
            Err(err) => {
                let _ = tx.send(RelayMessage::Error {
                    message: format!("invalid hello: {}", err),
                });
                None
            }
        };
    }
    None
}

async fn handle_device_message(
    message: DeviceMessage,
    device_id: &str,
    coordinator: &SharedCoordinator,
    tx: &mpsc::UnboundedSender<RelayMessage>,
) {
    match message {
        DeviceMessage::Decision {
            request_id,
            decision,
        } => {
            match coordinator
                .on_device_response(request_id, decision, device_id)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    // DeviceMismatch and NotFound go back to the device;
                    // stale duplicates were already swallowed upstream.
                    let _ = tx.send(RelayMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
        }
        DeviceMessage::Ping => {
            coordinator.registry().touch(device_id);
            let _ = tx.send(RelayMessage::Pong);
        }
        DeviceMessage::Hello { .. } => {
            let _ = tx.send(RelayMessage::Error {
                message: "already attached".into(),
            });
        }
    }
}
