use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{DeviceDecision, RelayMessage};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::RequestLedger;
use crate::notifier::{BridgeEvent, EventFilter, EventStream, Notifier};
use crate::registry::{Device, SessionRegistry};
use crate::request::{OperationKind, Request, RequestStatus, Resolver};
use crate::transport::DeviceTransport;

/// Facade used by agents to submit requests and by the transport layer to
/// deliver device responses. Holds no request state of its own; the ledger's
/// per-request CAS is the only point of mutual exclusion.
pub struct Coordinator {
    ledger: Arc<dyn RequestLedger>,
    registry: Arc<SessionRegistry>,
    notifier: Notifier,
    config: BridgeConfig,
    /// Serializes pushes per device so redelivery drains stay FIFO.
    delivery_locks: DashMap<String, Arc<Mutex<()>>>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds the coordinator and starts the background expiry sweep.
    /// Requires a running tokio runtime.
    pub fn new(
        ledger: Arc<dyn RequestLedger>,
        registry: Arc<SessionRegistry>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let event_backlog = config.event_backlog;
        let sweep_interval = config.sweep_interval;
        let coordinator = Arc::new(Self {
            ledger,
            registry,
            notifier: Notifier::new(event_backlog),
            config,
            delivery_locks: DashMap::new(),
            sweeper: parking_lot::Mutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.sweep_once().await;
            }
        });
        *coordinator.sweeper.lock() = Some(handle);

        coordinator
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn RequestLedger> {
        &self.ledger
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.notifier.subscribe(filter)
    }

    /// Creates a request and attempts one opportunistic delivery. A
    /// disconnected device just leaves the request queued toward its TTL.
    pub async fn submit(
        &self,
        agent: &str,
        device_id: &str,
        kind: OperationKind,
        payload: Bytes,
        summary: &str,
        ttl: Option<Duration>,
    ) -> BridgeResult<Request> {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(kind));
        let request = self
            .ledger
            .create(agent, device_id, kind, payload, summary, ttl)
            .await?;
        info!(request = %request.id, agent, device = %device_id, kind = %kind, "request submitted");
        self.notifier.publish(BridgeEvent::created(&request));

        if let Err(err) = self.deliver(request.id).await {
            // Recovered locally: the request stays pending and is retried
            // on reconnect or the next sweep pass.
            debug!(request = %request.id, %err, "initial delivery deferred");
        }
        Ok(request)
    }

    /// Pushes a pending request over the device's current transport. Leaves
    /// the request pending on any transport failure.
    pub async fn deliver(&self, id: Uuid) -> BridgeResult<()> {
        let device_id = self.ledger.get(id).await?.device_id;
        let lock = self.delivery_lock(&device_id);
        let _guard = lock.lock().await;

        // Re-read under the device lock: a racing submit, sweep pass, or
        // resolution may have already handled this request.
        let request = self.ledger.get(id).await?;
        if request.status != RequestStatus::Pending || request.delivered_at.is_some() {
            return Ok(());
        }

        let transport = self.registry.transport(&request.device_id).ok_or_else(|| {
            BridgeError::TransportUnavailable(format!("{} has no live transport", request.device_id))
        })?;

        let message = RelayMessage::Approval {
            envelope: request.envelope(),
        };
        match transport.send(&request.device_id, message).await {
            Ok(()) => {
                self.registry.touch(&request.device_id);
                self.ledger.mark_delivered(id, Utc::now()).await?;
                debug!(request = %id, device = %request.device_id, "request delivered");
                Ok(())
            }
            Err(err) => {
                self.registry.mark_degraded(&request.device_id);
                warn!(request = %id, device = %request.device_id, %err, "delivery failed; will retry on reconnect");
                Err(err)
            }
        }
    }

    /// Applies a device verdict. A stale or duplicate response is swallowed;
    /// a response from the wrong device is rejected without touching the
    /// request.
    pub async fn on_device_response(
        &self,
        request_id: Uuid,
        decision: DeviceDecision,
        device_id: &str,
    ) -> BridgeResult<()> {
        let request = self.ledger.get(request_id).await?;
        if request.device_id != device_id {
            warn!(request = %request_id, responder = %device_id, target = %request.device_id, "device mismatch on response");
            return Err(BridgeError::DeviceMismatch {
                target: request.device_id,
                responder: device_id.to_string(),
            });
        }

        self.registry.touch(device_id);
        let resolver = Resolver::Device {
            device_id: device_id.to_string(),
        };
        match self
            .ledger
            .resolve(request_id, RequestStatus::from(decision), resolver)
            .await
        {
            Ok(resolved) => {
                info!(request = %request_id, device = %device_id, status = %resolved.status, "request resolved by device");
                self.notifier.publish(BridgeEvent::resolved(&resolved));
                Ok(())
            }
            // Expected race against expiry or cancel; not an error to
            // surface to the device.
            Err(BridgeError::AlreadyResolved { status, .. }) => {
                debug!(request = %request_id, %status, "stale device response ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Cooperative cancel; only succeeds while pending.
    pub async fn cancel(&self, id: Uuid, agent: &str) -> BridgeResult<Request> {
        let cancelled = self
            .ledger
            .resolve(
                id,
                RequestStatus::Cancelled,
                Resolver::Agent {
                    agent: agent.to_string(),
                },
            )
            .await?;
        info!(request = %id, agent, "request cancelled");
        self.notifier.publish(BridgeEvent::resolved(&cancelled));
        Ok(cancelled)
    }

    /// Blocks until the request reaches a terminal state or the timeout
    /// elapses. Subscribes before re-checking status so a resolution landing
    /// in between is not missed.
    pub async fn await_resolution(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> BridgeResult<RequestStatus> {
        let mut stream = self.notifier.subscribe(EventFilter::Request(id));
        let current = self.ledger.get(id).await?;
        if current.status.is_terminal() {
            return Ok(current.status);
        }

        let wait = async {
            while let Some(event) = stream.recv().await {
                if let BridgeEvent::RequestResolved { status, .. } = event {
                    return Some(status);
                }
            }
            None
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                // Notifier closed under us; fall back to a direct read.
                let request = self.ledger.get(id).await?;
                if request.status.is_terminal() {
                    Ok(request.status)
                } else {
                    Err(BridgeError::Timeout)
                }
            }
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    pub fn pair_device(&self, device_id: &str, fingerprint: &str) -> Device {
        self.registry.pair(device_id, fingerprint)
    }

    pub fn unpair_device(&self, device_id: &str) -> BridgeResult<()> {
        self.registry.unpair(device_id)?;
        // In-flight delivers keep their Arc; a re-pair mints a fresh lock.
        self.delivery_locks.remove(device_id);
        Ok(())
    }

    /// Installs a fresh transport and drains the device's pending backlog
    /// over it in creation order.
    pub async fn attach_device(
        &self,
        device_id: &str,
        transport: Arc<dyn DeviceTransport>,
    ) -> BridgeResult<Device> {
        // Swap and reset under the delivery lock so an in-flight push over
        // the old transport cannot re-stamp a delivery mark (or downgrade
        // the fresh session) after the reset.
        let device = {
            let lock = self.delivery_lock(device_id);
            let _guard = lock.lock().await;
            let device = self.registry.attach(device_id, transport)?;
            self.ledger.reset_delivery(device_id).await?;
            device
        };
        self.notifier.publish(BridgeEvent::DeviceConnected {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
        });
        self.redeliver_pending(device_id).await;
        Ok(device)
    }

    pub async fn detach_device(&self, device_id: &str) -> BridgeResult<()> {
        self.registry.detach(device_id)?;
        self.notifier.publish(BridgeEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Detach for a specific connection's cleanup path; a superseded
    /// connection finds a newer transport installed and leaves it alone.
    pub async fn detach_device_transport(
        &self,
        device_id: &str,
        transport: &Arc<dyn DeviceTransport>,
    ) -> BridgeResult<bool> {
        let detached = self.registry.detach_if_current(device_id, transport)?;
        if detached {
            self.notifier.publish(BridgeEvent::DeviceDisconnected {
                device_id: device_id.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(detached)
    }

    /// Stops the background sweep. Idempotent.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn delivery_lock_count(&self) -> usize {
        self.delivery_locks.len()
    }

    fn delivery_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.delivery_locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One pass per connection attempt: stops at the first transport
    /// failure instead of hammering a flaky link.
    async fn redeliver_pending(&self, device_id: &str) {
        let pending = match self.ledger.pending_for_device(device_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(device = %device_id, %err, "failed to list pending backlog");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(device = %device_id, count = pending.len(), "redelivering pending backlog");
        for request in pending {
            if self.deliver(request.id).await.is_err() {
                break;
            }
        }
    }

    async fn sweep_once(&self) {
        match self.ledger.sweep_expired(Utc::now()).await {
            Ok(expired) => {
                for request in expired {
                    debug!(request = %request.id, device = %request.device_id, "request expired");
                    self.notifier.publish(BridgeEvent::resolved(&request));
                }
            }
            Err(err) => warn!(%err, "expiry sweep failed"),
        }

        // Opportunistic redelivery of anything never pushed, one attempt
        // per sweep pass.
        let undelivered = match self.ledger.pending_undelivered().await {
            Ok(undelivered) => undelivered,
            Err(err) => {
                warn!(%err, "failed to list undelivered requests");
                return;
            }
        };
        for request in undelivered {
            if self.registry.transport(&request.device_id).is_none() {
                continue;
            }
            if let Err(err) = self.deliver(request.id).await {
                debug!(request = %request.id, %err, "sweep redelivery deferred");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::ledger::InMemoryLedger;
    use crate::transport::ChannelTransport;

    fn build(config: BridgeConfig) -> (Arc<Coordinator>, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let ledger = InMemoryLedger::new(registry.clone(), config.clone());
        let coordinator = Coordinator::new(ledger, registry.clone(), config);
        (coordinator, registry)
    }

    async fn submit_shell(
        coordinator: &Coordinator,
        device_id: &str,
        ttl: Option<Duration>,
    ) -> Request {
        coordinator
            .submit(
                "agent-1",
                device_id,
                OperationKind::ShellExec,
                Bytes::from_static(b"ls -la"),
                "run: ls -la",
                ttl,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_to_disconnected_device_queues() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");

        let request = submit_shell(&coordinator, "dev-1", None).await;
        assert_eq!(request.status, RequestStatus::Pending);
        let stored = coordinator.ledger().get(request.id).await.unwrap();
        assert!(stored.delivered_at.is_none());
    }

    #[tokio::test]
    async fn submit_to_connected_device_delivers_envelope() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let (transport, mut rx) = ChannelTransport::pair();
        coordinator.attach_device("dev-1", transport).await.unwrap();

        let request = submit_shell(&coordinator, "dev-1", None).await;
        let message = rx.recv().await.unwrap();
        match message {
            RelayMessage::Approval { envelope } => {
                assert_eq!(envelope.request_id, request.id);
                assert_eq!(envelope.kind, "shell_exec");
                assert_eq!(envelope.summary, "run: ls -la");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn response_from_wrong_device_is_rejected() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        coordinator.pair_device("dev-2", "fp");

        let request = submit_shell(&coordinator, "dev-1", None).await;
        let err = coordinator
            .on_device_response(request.id, DeviceDecision::Approved, "dev-2")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeviceMismatch { .. }));

        // The request is untouched.
        let stored = coordinator.ledger().get(request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_device_response_is_swallowed() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let request = submit_shell(&coordinator, "dev-1", None).await;

        coordinator
            .on_device_response(request.id, DeviceDecision::Approved, "dev-1")
            .await
            .unwrap();
        // Second identical response is a no-op, not an error.
        coordinator
            .on_device_response(request.id, DeviceDecision::Denied, "dev-1")
            .await
            .unwrap();

        let stored = coordinator.ledger().get(request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn cancel_after_resolution_reports_already_resolved() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let request = submit_shell(&coordinator, "dev-1", None).await;

        coordinator
            .on_device_response(request.id, DeviceDecision::Denied, "dev-1")
            .await
            .unwrap();
        let err = coordinator.cancel(request.id, "agent-1").await.unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn await_returns_terminal_status_already_reached() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let request = submit_shell(&coordinator, "dev-1", None).await;
        coordinator.cancel(request.id, "agent-1").await.unwrap();

        let status = coordinator
            .await_resolution(request.id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn unpair_drops_delivery_state() {
        let (coordinator, registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        submit_shell(&coordinator, "dev-1", None).await;
        assert_eq!(coordinator.delivery_lock_count(), 1);

        coordinator.unpair_device("dev-1").unwrap();
        assert_eq!(coordinator.delivery_lock_count(), 0);
        assert!(!registry.is_paired("dev-1"));
    }

    #[tokio::test]
    async fn failed_send_degrades_until_reattach() {
        let (coordinator, registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let (dead, dead_rx) = ChannelTransport::pair();
        coordinator.attach_device("dev-1", dead).await.unwrap();
        drop(dead_rx);

        let request = submit_shell(&coordinator, "dev-1", None).await;
        assert_eq!(
            registry.status("dev-1").unwrap(),
            crate::registry::ConnectivityState::Degraded
        );

        // A fresh connection recovers the session and drains the backlog.
        let (live, mut live_rx) = ChannelTransport::pair();
        coordinator.attach_device("dev-1", live).await.unwrap();
        let message = live_rx.recv().await.unwrap();
        match message {
            RelayMessage::Approval { envelope } => assert_eq!(envelope.request_id, request.id),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(
            registry.status("dev-1").unwrap(),
            crate::registry::ConnectivityState::Connected
        );
    }

    #[tokio::test]
    async fn await_times_out_on_silent_device() {
        let (coordinator, _registry) = build(BridgeConfig::default());
        coordinator.pair_device("dev-1", "fp");
        let request = submit_shell(&coordinator, "dev-1", None).await;

        let err = coordinator
            .await_resolution(request.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }
}
