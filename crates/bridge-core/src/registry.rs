use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};
use crate::transport::DeviceTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Disconnected,
    Connected,
    /// Attached but the last send failed; redelivery will retry.
    Degraded,
}

/// A paired mobile endpoint. Never silently removed; unpairing is explicit.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub fingerprint: String,
    pub connectivity: ConnectivityState,
    pub paired_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

struct DeviceSlot {
    device: Device,
    /// At most one live transport per device; a new attach supersedes it.
    transport: Option<Arc<dyn DeviceTransport>>,
}

/// Owns Device and Session records. The per-device transport slot is
/// single-writer: swaps happen under the entry guard, the superseded
/// transport is closed outside it.
#[derive(Default)]
pub struct SessionRegistry {
    devices: DashMap<String, DeviceSlot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-pairing refreshes the fingerprint and returns the
    /// existing record.
    pub fn pair(&self, device_id: &str, fingerprint: &str) -> Device {
        let mut slot = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSlot {
                device: Device {
                    device_id: device_id.to_string(),
                    fingerprint: fingerprint.to_string(),
                    connectivity: ConnectivityState::Disconnected,
                    paired_at: Utc::now(),
                    last_seen: None,
                },
                transport: None,
            });
        if slot.device.fingerprint != fingerprint {
            debug!(device = %device_id, "re-pair updated fingerprint");
            slot.device.fingerprint = fingerprint.to_string();
        }
        slot.device.clone()
    }

    pub fn unpair(&self, device_id: &str) -> BridgeResult<()> {
        let (_, slot) = self
            .devices
            .remove(device_id)
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;
        if let Some(transport) = slot.transport {
            transport.close();
        }
        info!(device = %device_id, "device unpaired");
        Ok(())
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> BridgeResult<Device> {
        self.devices
            .get(device_id)
            .map(|slot| slot.device.clone())
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))
    }

    pub fn status(&self, device_id: &str) -> BridgeResult<ConnectivityState> {
        self.get(device_id).map(|device| device.connectivity)
    }

    /// Installs a fresh transport, superseding and closing any stale one.
    pub fn attach(
        &self,
        device_id: &str,
        transport: Arc<dyn DeviceTransport>,
    ) -> BridgeResult<Device> {
        let (device, stale) = {
            let mut slot = self
                .devices
                .get_mut(device_id)
                .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;
            let stale = slot.transport.replace(transport);
            slot.device.connectivity = ConnectivityState::Connected;
            slot.device.last_seen = Some(Utc::now());
            (slot.device.clone(), stale)
        };
        // Close the superseded link outside the entry guard.
        if let Some(stale) = stale {
            debug!(device = %device_id, "closing superseded transport");
            stale.close();
        }
        info!(device = %device_id, "transport attached");
        Ok(device)
    }

    /// Marks the device disconnected. Pending requests targeting it are
    /// untouched; they continue toward expiry.
    pub fn detach(&self, device_id: &str) -> BridgeResult<()> {
        let transport = {
            let mut slot = self
                .devices
                .get_mut(device_id)
                .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;
            slot.device.connectivity = ConnectivityState::Disconnected;
            slot.device.last_seen = Some(Utc::now());
            slot.transport.take()
        };
        if let Some(transport) = transport {
            transport.close();
        }
        info!(device = %device_id, "transport detached");
        Ok(())
    }

    /// Detach only if `transport` is still the installed one. Lets a
    /// superseded connection's cleanup path avoid knocking out its
    /// replacement.
    pub fn detach_if_current(
        &self,
        device_id: &str,
        transport: &Arc<dyn DeviceTransport>,
    ) -> BridgeResult<bool> {
        let is_current = {
            let slot = self
                .devices
                .get(device_id)
                .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;
            slot.transport
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, transport))
        };
        if is_current {
            self.detach(device_id)?;
        }
        Ok(is_current)
    }

    pub fn transport(&self, device_id: &str) -> Option<Arc<dyn DeviceTransport>> {
        self.devices
            .get(device_id)
            .and_then(|slot| slot.transport.clone())
    }

    /// Records a transport-level send failure without dropping the session.
    pub fn mark_degraded(&self, device_id: &str) {
        if let Some(mut slot) = self.devices.get_mut(device_id) {
            if slot.device.connectivity == ConnectivityState::Connected {
                slot.device.connectivity = ConnectivityState::Degraded;
            }
        }
    }

    /// Updates last-seen (and recovers from `Degraded`) on any successful
    /// transport event.
    pub fn touch(&self, device_id: &str) {
        if let Some(mut slot) = self.devices.get_mut(device_id) {
            slot.device.last_seen = Some(Utc::now());
            if slot.device.connectivity == ConnectivityState::Degraded {
                slot.device.connectivity = ConnectivityState::Connected;
            }
        }
    }

    pub fn paired_count(&self) -> usize {
        self.devices.len()
    }

    pub fn connected_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|slot| slot.device.connectivity == ConnectivityState::Connected)
            .count()
    }
}
