//! The adapter capability consumed by the session.
//!
//! A [`BleAdapter`] wraps whatever BLE stack the platform provides. Requests
//! return their outcome directly; unsolicited events (advertisements,
//! disconnects, notifications) are pushed into an [`AdapterEventSink`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::error::Result;

/// A capability the session needs from the platform.
///
/// The platform maps these onto its own permission model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Capability {
    /// Discover nearby peripherals.
    Scan,
    /// Open GATT connections.
    Connect,
}

/// Every capability a full session needs.
pub const ALL_CAPABILITIES: &[Capability] = &[Capability::Scan, Capability::Connect];

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PermissionOutcome {
    /// All requested capabilities were granted.
    Granted,
    /// At least one capability was refused.
    Denied,
}

impl PermissionOutcome {
    /// Check if granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Ownership of one running scan.
///
/// Not `Clone`: the scan is stopped by handing the handle back to
/// [`BleAdapter::stop_scan`], which can happen only once.
#[derive(Debug, PartialEq, Eq)]
pub struct ScanHandle {
    id: u64,
}

impl ScanHandle {
    /// Create a handle (adapter implementations only).
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// Get the adapter-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Copyable reference to an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Ownership of one open connection.
///
/// Not `Clone`: the connection is closed by handing the handle back to
/// [`BleAdapter::disconnect`].
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
    device_id: String,
}

impl ConnectionHandle {
    /// Create a handle (adapter implementations only).
    pub fn new(id: ConnectionId, device_id: impl Into<String>) -> Self {
        Self {
            id,
            device_id: device_id.into(),
        }
    }

    /// Get the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the identifier of the connected device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// A discovered characteristic and the descriptors attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptor UUIDs.
    pub descriptors: BTreeSet<Uuid>,
}

/// Result of service discovery: services keyed by UUID, each with its
/// characteristics keyed by UUID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceMap {
    services: HashMap<Uuid, HashMap<Uuid, CharacteristicInfo>>,
}

impl ServiceMap {
    /// Create an empty service map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a service with no characteristics.
    pub fn add_service(&mut self, service: Uuid) {
        self.services.entry(service).or_default();
    }

    /// Record a characteristic (and its descriptors) under a service.
    pub fn add_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptors: impl IntoIterator<Item = Uuid>,
    ) {
        let entry = self
            .services
            .entry(service)
            .or_default()
            .entry(characteristic)
            .or_insert_with(|| CharacteristicInfo {
                uuid: characteristic,
                descriptors: BTreeSet::new(),
            });
        entry.descriptors.extend(descriptors);
    }

    /// Check if a service was discovered.
    pub fn has_service(&self, service: &Uuid) -> bool {
        self.services.contains_key(service)
    }

    /// Look up a characteristic within a service.
    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<&CharacteristicInfo> {
        self.services.get(service)?.get(characteristic)
    }

    /// Number of discovered services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Unsolicited events pushed by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A single advertisement.
    Advertisement(Advertisement),
    /// A batch of advertisements, to be evaluated in order.
    AdvertisementBatch(Vec<Advertisement>),
    /// The running scan failed with a platform error code.
    ScanFailed(i32),
    /// The peripheral behind a connection went away.
    Disconnected(ConnectionId),
    /// A characteristic value changed (notification).
    CharacteristicChanged {
        /// Connection the notification arrived on.
        connection: ConnectionId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// New value.
        value: Bytes,
    },
}

/// Where adapters deliver [`AdapterEvent`]s.
///
/// Cloning is cheap. Sending never blocks; events sent after the session has
/// shut down are dropped.
#[derive(Debug, Clone)]
pub struct AdapterEventSink {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterEventSink {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event.
    pub fn send(&self, event: AdapterEvent) {
        if self.tx.send(event).is_err() {
            trace!("Adapter event dropped, session is gone");
        }
    }

    /// Check if the receiving session has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// BLE capability required by [`BleUidSession`](crate::BleUidSession).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Check if every capability in `capabilities` is granted.
    fn has_permission(&self, capabilities: &[Capability]) -> bool;

    /// Ask the platform to grant `capabilities`.
    async fn request_permission(&self, capabilities: &[Capability]) -> PermissionOutcome;

    /// Check if the radio is powered on.
    fn is_adapter_enabled(&self) -> bool;

    /// Begin an unfiltered scan, delivering advertisements to `sink`.
    async fn start_scan(&self, sink: AdapterEventSink) -> Result<ScanHandle>;

    /// Stop a scan started by [`start_scan`](Self::start_scan).
    async fn stop_scan(&self, scan: ScanHandle) -> Result<()>;

    /// Connect to a device; disconnects and notifications go to `sink`.
    async fn connect(&self, device_id: &str, sink: AdapterEventSink) -> Result<ConnectionHandle>;

    /// Discover services and characteristics on an open connection.
    async fn discover_services(&self, connection: ConnectionId) -> Result<ServiceMap>;

    /// Turn on notifications for a characteristic.
    async fn enable_notification(&self, connection: ConnectionId, characteristic: Uuid) -> bool;

    /// Write a descriptor value.
    async fn write_descriptor(
        &self,
        connection: ConnectionId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Read a characteristic value.
    async fn read_characteristic(&self, connection: ConnectionId, characteristic: Uuid) -> Result<Bytes>;

    /// Close a connection.
    async fn disconnect(&self, connection: ConnectionHandle) -> Result<()>;
}
