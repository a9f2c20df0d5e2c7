use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::request::{OperationKind, Request, RequestStatus};

/// Lifecycle events fanned out to local subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    RequestCreated {
        request_id: Uuid,
        agent: String,
        device_id: String,
        kind: OperationKind,
        timestamp: DateTime<Utc>,
    },
    RequestResolved {
        request_id: Uuid,
        device_id: String,
        kind: OperationKind,
        status: RequestStatus,
        timestamp: DateTime<Utc>,
    },
    DeviceConnected {
        device_id: String,
        timestamp: DateTime<Utc>,
    },
    DeviceDisconnected {
        device_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl BridgeEvent {
    pub fn created(request: &Request) -> Self {
        BridgeEvent::RequestCreated {
            request_id: request.id,
            agent: request.agent.clone(),
            device_id: request.device_id.clone(),
            kind: request.kind,
            timestamp: request.created_at,
        }
    }

    pub fn resolved(request: &Request) -> Self {
        BridgeEvent::RequestResolved {
            request_id: request.id,
            device_id: request.device_id.clone(),
            kind: request.kind,
            status: request.status,
            timestamp: request.resolved_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            BridgeEvent::RequestCreated { request_id, .. }
            | BridgeEvent::RequestResolved { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            BridgeEvent::RequestCreated { device_id, .. }
            | BridgeEvent::RequestResolved { device_id, .. }
            | BridgeEvent::DeviceConnected { device_id, .. }
            | BridgeEvent::DeviceDisconnected { device_id, .. } => device_id,
        }
    }
}

/// Subscription scope.
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    #[default]
    All,
    Request(Uuid),
    Device(String),
}

impl EventFilter {
    fn matches(&self, event: &BridgeEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Request(id) => event.request_id() == Some(*id),
            EventFilter::Device(device_id) => event.device_id() == device_id,
        }
    }
}

/// Decoupled fan-out over a bounded broadcast channel. Slow subscribers lag
/// and drop instead of blocking the coordinator's critical path.
pub struct Notifier {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Notifier {
    pub fn new(backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BridgeEvent) {
        // No subscribers is a normal quiet state.
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

/// A filtered view of the event feed. `recv` returns `None` once the
/// notifier is gone.
pub struct EventStream {
    rx: broadcast::Receiver<BridgeEvent>,
    filter: EventFilter,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged; dropped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(device: &str) -> BridgeEvent {
        BridgeEvent::DeviceConnected {
            device_id: device.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn filter_scopes_subscription_to_device() {
        let notifier = Notifier::new(16);
        let mut stream = notifier.subscribe(EventFilter::Device("dev-2".into()));

        notifier.publish(connected("dev-1"));
        notifier.publish(connected("dev-2"));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.device_id(), "dev-2");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let notifier = Notifier::new(16);
        notifier.publish(connected("dev-1"));
    }

    #[tokio::test]
    async fn request_filter_sees_created_then_resolved() {
        let notifier = Notifier::new(16);
        let id = Uuid::new_v4();
        let mut stream = notifier.subscribe(EventFilter::Request(id));

        notifier.publish(BridgeEvent::RequestCreated {
            request_id: id,
            agent: "agent-1".into(),
            device_id: "dev-1".into(),
            kind: OperationKind::ShellExec,
            timestamp: Utc::now(),
        });
        notifier.publish(BridgeEvent::RequestResolved {
            request_id: id,
            device_id: "dev-1".into(),
            kind: OperationKind::ShellExec,
            status: RequestStatus::Approved,
            timestamp: Utc::now(),
        });

        assert!(matches!(
            stream.recv().await.unwrap(),
            BridgeEvent::RequestCreated { .. }
        ));
        assert!(matches!(
            stream.recv().await.unwrap(),
            BridgeEvent::RequestResolved {
                status: RequestStatus::Approved,
                ..
            }
        ));
    }
}
