//! Shared wire definitions for relay ↔ device communication.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for the mobile side without pulling in the bridge runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device verdict on a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceDecision {
    Approved,
    Denied,
}

/// Outbound approval envelope pushed to a paired device. Carries only the
/// human-facing fields; the operation payload itself never leaves the PC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEnvelope {
    pub request_id: Uuid,
    pub kind: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Messages sent from a device to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// First frame on every connection; identifies the device.
    Hello {
        device_id: String,
        fingerprint: String,
    },
    /// Verdict for a previously delivered approval envelope.
    Decision {
        request_id: Uuid,
        decision: DeviceDecision,
    },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Messages sent from the relay to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Acknowledges `Hello`; the device is attached and may receive approvals.
    HelloAck { device_id: String },
    /// A pending request awaiting the device's verdict.
    Approval {
        #[serde(flatten)]
        envelope: ApprovalEnvelope,
    },
    Pong,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_message_round_trips_tagged() {
        let id = Uuid::new_v4();
        let msg = DeviceMessage::Decision {
            request_id: id,
            decision: DeviceDecision::Approved,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"decision\""));
        assert!(json.contains("\"approved\""));
        let back: DeviceMessage = serde_json::from_str(&json).unwrap();
        match back {
            DeviceMessage::Decision {
                request_id,
                decision,
            } => {
                assert_eq!(request_id, id);
                assert_eq!(decision, DeviceDecision::Approved);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn approval_flattens_envelope_fields() {
        let msg = RelayMessage::Approval {
            envelope: ApprovalEnvelope {
                request_id: Uuid::new_v4(),
                kind: "shell_exec".into(),
                summary: "rm -rf /tmp/x".into(),
                created_at: Utc::now(),
                expires_at: Utc::now(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"approval\""));
        assert!(json.contains("\"summary\""));
        assert!(!json.contains("\"envelope\""));
    }
}
