use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::SessionRegistry;
use crate::request::{OperationKind, Request, RequestStatus, Resolver};

/// Exclusive owner of Request records. Implementations must make every
/// status transition an atomic compare-and-set against `Pending`; the
/// in-memory backend satisfies this by mutating under the per-entry guard.
#[async_trait]
pub trait RequestLedger: Send + Sync {
    async fn create(
        &self,
        agent: &str,
        device_id: &str,
        kind: OperationKind,
        payload: Bytes,
        summary: &str,
        ttl: Duration,
    ) -> BridgeResult<Request>;

    async fn get(&self, id: Uuid) -> BridgeResult<Request>;

    /// Commits a terminal status. Fails with `AlreadyResolved` when another
    /// transition (device response, expiry, cancel) won the race.
    async fn resolve(
        &self,
        id: Uuid,
        status: RequestStatus,
        resolver: Resolver,
    ) -> BridgeResult<Request>;

    /// Expires every pending request whose deadline passed, returning the
    /// transitioned records. Safe to race with `resolve`.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> BridgeResult<Vec<Request>>;

    /// Pending requests targeting `device_id`, in creation (sequence) order.
    async fn pending_for_device(&self, device_id: &str) -> BridgeResult<Vec<Request>>;

    /// Pending requests that have never been pushed over a transport, in
    /// sequence order. Drives sweep-pass redelivery.
    async fn pending_undelivered(&self) -> BridgeResult<Vec<Request>>;

    /// Records a successful push. No-op when the request is no longer
    /// pending.
    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> BridgeResult<()>;

    /// Clears delivery marks for a device so a fresh connection gets the
    /// full pending backlog again.
    async fn reset_delivery(&self, device_id: &str) -> BridgeResult<()>;
}

/// In-memory ledger for a bridge session. Durable backends plug in behind
/// the same trait.
pub struct InMemoryLedger {
    registry: Arc<SessionRegistry>,
    config: BridgeConfig,
    requests: DashMap<Uuid, Request>,
    next_seq: AtomicU64,
}

impl InMemoryLedger {
    pub fn new(registry: Arc<SessionRegistry>, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            requests: DashMap::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    fn validate(&self, payload: &Bytes, summary: &str) -> BridgeResult<()> {
        if payload.is_empty() {
            return Err(BridgeError::InvalidPayload("empty payload".into()));
        }
        if payload.len() > self.config.max_payload_bytes {
            return Err(BridgeError::InvalidPayload(format!(
                "payload of {} bytes exceeds cap of {}",
                payload.len(),
                self.config.max_payload_bytes
            )));
        }
        if summary.trim().is_empty() {
            return Err(BridgeError::InvalidPayload("empty summary".into()));
        }
        Ok(())
    }

    /// The single CAS point: transitions `Pending -> status` under the
    /// entry guard or reports the already-committed terminal state.
    fn transition(
        &self,
        id: Uuid,
        status: RequestStatus,
        resolver: Resolver,
        now: DateTime<Utc>,
    ) -> BridgeResult<Request> {
        let mut entry = self.requests.get_mut(&id).ok_or(BridgeError::NotFound(id))?;
        if entry.status.is_terminal() {
            return Err(BridgeError::AlreadyResolved {
                id,
                status: entry.status,
            });
        }
        entry.status = status;
        entry.resolved_at = Some(now);
        entry.resolved_by = Some(resolver);
        Ok(entry.clone())
    }
}

#[async_trait]
impl RequestLedger for InMemoryLedger {
    async fn create(
        &self,
        agent: &str,
        device_id: &str,
        kind: OperationKind,
        payload: Bytes,
        summary: &str,
        ttl: Duration,
    ) -> BridgeResult<Request> {
        if !self.registry.is_paired(device_id) {
            return Err(BridgeError::UnknownDevice(device_id.to_string()));
        }
        self.validate(&payload, summary)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| BridgeError::InvalidPayload("ttl out of range".into()))?;
        let request = Request {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            agent: agent.to_string(),
            device_id: device_id.to_string(),
            kind,
            payload,
            summary: summary.to_string(),
            created_at: now,
            expires_at: now + ttl,
            status: RequestStatus::Pending,
            delivered_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        self.requests.insert(request.id, request.clone());
        debug!(request = %request.id, agent, device = %device_id, kind = %kind, "request created");
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> BridgeResult<Request> {
        self.requests
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(BridgeError::NotFound(id))
    }

    async fn resolve(
        &self,
        id: Uuid,
        status: RequestStatus,
        resolver: Resolver,
    ) -> BridgeResult<Request> {
        debug_assert!(status.is_terminal());
        self.transition(id, status, resolver, Utc::now())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> BridgeResult<Vec<Request>> {
        // Collect candidates first; transition one entry at a time so no
        // guard outlives a single request's CAS.
        let due: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            match self.transition(id, RequestStatus::Expired, Resolver::System, now) {
                Ok(request) => expired.push(request),
                // A device response or cancel won the race; that's fine.
                Err(BridgeError::AlreadyResolved { .. }) | Err(BridgeError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }

    async fn pending_for_device(&self, device_id: &str) -> BridgeResult<Vec<Request>> {
        let mut pending: Vec<Request> = self
            .requests
            .iter()
            .filter(|entry| {
                entry.status == RequestStatus::Pending && entry.device_id == device_id
            })
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by_key(|request| request.seq);
        Ok(pending)
    }

    async fn pending_undelivered(&self) -> BridgeResult<Vec<Request>> {
        let mut pending: Vec<Request> = self
            .requests
            .iter()
            .filter(|entry| entry.status == RequestStatus::Pending && entry.delivered_at.is_none())
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by_key(|request| request.seq);
        Ok(pending)
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> BridgeResult<()> {
        if let Some(mut entry) = self.requests.get_mut(&id) {
            if entry.status == RequestStatus::Pending {
                entry.delivered_at = Some(at);
            }
        }
        Ok(())
    }

    async fn reset_delivery(&self, device_id: &str) -> BridgeResult<()> {
        for mut entry in self.requests.iter_mut() {
            if entry.status == RequestStatus::Pending && entry.device_id == device_id {
                entry.delivered_at = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_device(device_id: &str) -> Arc<InMemoryLedger> {
        let registry = Arc::new(SessionRegistry::new());
        registry.pair(device_id, "fp");
        InMemoryLedger::new(registry, BridgeConfig::default())
    }

    async fn create_one(ledger: &InMemoryLedger, device_id: &str, ttl: Duration) -> Request {
        ledger
            .create(
                "agent-1",
                device_id,
                OperationKind::ShellExec,
                Bytes::from_static(b"rm -rf /tmp/x"),
                "run: rm -rf /tmp/x",
                ttl,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_rejects_unknown_device() {
        let registry = Arc::new(SessionRegistry::new());
        let ledger = InMemoryLedger::new(registry, BridgeConfig::default());
        let err = ledger
            .create(
                "agent-1",
                "ghost",
                OperationKind::ShellExec,
                Bytes::from_static(b"ls"),
                "run: ls",
                Duration::from_secs(120),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn create_rejects_empty_payload_and_summary() {
        let ledger = ledger_with_device("dev-1");
        let err = ledger
            .create(
                "agent-1",
                "dev-1",
                OperationKind::FileWrite,
                Bytes::new(),
                "write something",
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload(_)));

        let err = ledger
            .create(
                "agent-1",
                "dev-1",
                OperationKind::FileWrite,
                Bytes::from_static(b"data"),
                "   ",
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn resolve_is_single_shot() {
        let ledger = ledger_with_device("dev-1");
        let request = create_one(&ledger, "dev-1", Duration::from_secs(120)).await;

        let resolved = ledger
            .resolve(
                request.id,
                RequestStatus::Approved,
                Resolver::Device {
                    device_id: "dev-1".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, RequestStatus::Approved);
        assert!(resolved.resolved_at.is_some());

        let err = ledger
            .resolve(
                request.id,
                RequestStatus::Denied,
                Resolver::Device {
                    device_id: "dev-1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::AlreadyResolved {
                status: RequestStatus::Approved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sweep_expires_only_due_requests() {
        let ledger = ledger_with_device("dev-1");
        let due = create_one(&ledger, "dev-1", Duration::from_millis(10)).await;
        let not_due = create_one(&ledger, "dev-1", Duration::from_secs(600)).await;

        let cutoff = due.expires_at + chrono::Duration::milliseconds(1);
        let expired = ledger.sweep_expired(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, due.id);

        assert_eq!(
            ledger.get(due.id).await.unwrap().status,
            RequestStatus::Expired
        );
        assert_eq!(
            ledger.get(not_due.id).await.unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn sweep_loses_race_against_resolve() {
        let ledger = ledger_with_device("dev-1");
        let request = create_one(&ledger, "dev-1", Duration::from_millis(1)).await;
        ledger
            .resolve(
                request.id,
                RequestStatus::Approved,
                Resolver::Device {
                    device_id: "dev-1".into(),
                },
            )
            .await
            .unwrap();

        let cutoff = request.expires_at + chrono::Duration::seconds(1);
        let expired = ledger.sweep_expired(cutoff).await.unwrap();
        assert!(expired.is_empty());
        assert_eq!(
            ledger.get(request.id).await.unwrap().status,
            RequestStatus::Approved
        );
    }

    #[tokio::test]
    async fn pending_for_device_preserves_creation_order() {
        let ledger = ledger_with_device("dev-1");
        let first = create_one(&ledger, "dev-1", Duration::from_secs(120)).await;
        let second = create_one(&ledger, "dev-1", Duration::from_secs(120)).await;
        let third = create_one(&ledger, "dev-1", Duration::from_secs(120)).await;

        let pending = ledger.pending_for_device("dev-1").await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn delivery_marks_clear_on_reset() {
        let ledger = ledger_with_device("dev-1");
        let request = create_one(&ledger, "dev-1", Duration::from_secs(120)).await;
        ledger.mark_delivered(request.id, Utc::now()).await.unwrap();
        assert!(ledger.pending_undelivered().await.unwrap().is_empty());

        ledger.reset_delivery("dev-1").await.unwrap();
        let undelivered = ledger.pending_undelivered().await.unwrap();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].id, request.id);
    }
}
