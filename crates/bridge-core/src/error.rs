use thiserror::Error;
use uuid::Uuid;

use crate::request::RequestStatus;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("request not found: {0}")]
    NotFound(Uuid),
    /// The request already reached a terminal state. Informational for
    /// racing callers, not a fault to retry against.
    #[error("request {id} already resolved: {status}")]
    AlreadyResolved { id: Uuid, status: RequestStatus },
    /// A device tried to resolve a request targeting a different device.
    #[error("device {responder} cannot resolve request targeting {target}")]
    DeviceMismatch { target: String, responder: String },
    #[error("timed out waiting for resolution")]
    Timeout,
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
