use anyhow::Result;
use bridge_proto::{DeviceDecision, DeviceMessage, RelayMessage};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::pairing;

#[derive(Parser, Debug)]
#[command(name = "bridge-relay")]
#[command(about = "ShadowBridge relay server and device simulator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a paired device and answer approval requests
    Device {
        /// Relay URL (e.g., ws://localhost:6767)
        #[arg(short, long, default_value = "ws://localhost:6767")]
        url: String,

        /// Device ID to connect as (must be paired first)
        #[arg(short, long)]
        device: String,

        /// Pairing secret
        #[arg(short, long)]
        secret: String,

        /// What to do with incoming approval requests
        #[arg(long, value_enum, default_value_t = DecisionMode::Approve)]
        mode: DecisionMode,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DecisionMode {
    Approve,
    Deny,
    /// Let requests run out their TTL
    Ignore,
}

/// Simulated device: attaches over the websocket and answers every approval
/// envelope according to `mode`. Useful for exercising the relay end to end
/// without a phone.
pub async fn run_device_client(
    url: String,
    device: String,
    secret: String,
    mode: DecisionMode,
) -> Result<()> {
    let ws_url = format!("{}/ws/device/{}", url, device);
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let hello = DeviceMessage::Hello {
        device_id: device.clone(),
        fingerprint: pairing::fingerprint(&secret),
    };
    write
        .send(Message::Text(serde_json::to_string(&hello)?.into()))
        .await?;

    println!("Connected as device '{}', mode: {:?}", device, mode);

    while let Some(frame) = read.next().await {
        let frame = frame?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message: RelayMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!("skipping unparseable frame: {}", e);
                continue;
            }
        };
        match message {
            RelayMessage::HelloAck { .. } => {
                println!("Attached; waiting for approval requests...");
            }
            RelayMessage::Approval { envelope } => {
                println!(
                    "[{}] {} (expires {})",
                    envelope.kind, envelope.summary, envelope.expires_at
                );
                let decision = match mode {
                    DecisionMode::Approve => Some(DeviceDecision::Approved),
                    DecisionMode::Deny => Some(DeviceDecision::Denied),
                    DecisionMode::Ignore => None,
                };
                if let Some(decision) = decision {
                    let reply = DeviceMessage::Decision {
                        request_id: envelope.request_id,
                        decision,
                    };
                    write
                        .send(Message::Text(serde_json::to_string(&reply)?.into()))
                        .await?;
                    println!("  -> {:?}", decision);
                }
            }
            RelayMessage::Pong => {}
            RelayMessage::Error { message } => {
                error!("relay error: {}", message);
            }
        }
    }

    println!("Connection closed");
    Ok(())
}
