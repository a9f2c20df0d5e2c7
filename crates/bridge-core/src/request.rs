use std::fmt;
use std::time::Duration;

use bridge_proto::{ApprovalEnvelope, DeviceDecision};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation categories a device can be asked to approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ShellExec,
    FileWrite,
    FileTransfer,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ShellExec => "shell_exec",
            OperationKind::FileWrite => "file_write",
            OperationKind::FileTransfer => "file_transfer",
        }
    }

    /// Default approval window. File transfers get the longest window since
    /// the user may need to pick a destination on the device first.
    pub fn default_ttl(&self) -> Duration {
        match self {
            OperationKind::ShellExec => Duration::from_secs(120),
            OperationKind::FileWrite => Duration::from_secs(300),
            OperationKind::FileTransfer => Duration::from_secs(600),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request lifecycle states. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DeviceDecision> for RequestStatus {
    fn from(decision: DeviceDecision) -> Self {
        match decision {
            DeviceDecision::Approved => RequestStatus::Approved,
            DeviceDecision::Denied => RequestStatus::Denied,
        }
    }
}

/// Who committed the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Resolver {
    Device { device_id: String },
    Agent { agent: String },
    /// Expiry sweep or other internal transition.
    System,
}

/// A single approval request. All fields except `status` and the resolution
/// metadata are immutable after creation; the status transition is the one
/// point of mutual exclusion.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    /// Process-monotonic sequence, orders per-device redelivery.
    pub seq: u64,
    pub agent: String,
    pub device_id: String,
    pub kind: OperationKind,
    /// Opaque to the core; never leaves the PC.
    pub payload: Bytes,
    /// Human-readable summary shown on the device.
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RequestStatus,
    /// Set on successful push over a transport; cleared logically by
    /// reattach (a fresh connection redelivers everything pending).
    pub delivered_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Resolver>,
}

impl Request {
    /// The wire envelope pushed to the device for this request.
    pub fn envelope(&self) -> ApprovalEnvelope {
        ApprovalEnvelope {
            request_id: self.id,
            kind: self.kind.as_str().to_string(),
            summary: self.summary.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && self.expires_at <= now
    }
}
