//! Desktop adapter backed by btleplug.
//!
//! Desktop operating systems mediate Bluetooth permissions themselves, so
//! permission checks always succeed here. The radio is reported enabled until
//! the adapter announces it has been powered off.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{
    AdapterEvent, AdapterEventSink, BleAdapter, Capability, ConnectionHandle, ConnectionId,
    PermissionOutcome, ScanHandle, ServiceMap,
};
use crate::ble::advertising::Advertisement;
use crate::error::{Error, Result};

/// An open connection and the tasks forwarding its events.
struct PlatformConnection {
    peripheral: Peripheral,
    tasks: Vec<JoinHandle<()>>,
}

/// [`BleAdapter`] implementation for Linux (BlueZ), macOS and Windows.
pub struct PlatformAdapter {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Cleared when the adapter reports it is powered off.
    powered: Arc<AtomicBool>,
    /// Source of scan and connection ids.
    next_id: AtomicU64,
    /// Event forwarding tasks of running scans.
    scans: RwLock<HashMap<u64, JoinHandle<()>>>,
    /// Open connections.
    connections: RwLock<HashMap<ConnectionId, PlatformConnection>>,
    /// Task watching adapter power state.
    state_watcher: Option<JoinHandle<()>>,
}

impl PlatformAdapter {
    /// Use the first Bluetooth adapter on this system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter).await)
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Self {
        let powered = Arc::new(AtomicBool::new(true));

        let state_watcher = match adapter.events().await {
            Ok(mut events) => {
                let powered = powered.clone();
                Some(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::StateUpdate(state) = event {
                            let on = !matches!(state, CentralState::PoweredOff);
                            debug!("Adapter power state: {:?}", state);
                            powered.store(on, Ordering::SeqCst);
                        }
                    }
                }))
            }
            Err(e) => {
                warn!("Cannot watch adapter state: {}", e);
                None
            }
        };

        Self {
            adapter,
            powered,
            next_id: AtomicU64::new(1),
            scans: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            state_watcher,
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Number of scans currently running.
    pub fn active_scans(&self) -> usize {
        self.scans.read().len()
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.connections.read().len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn peripheral(&self, connection: ConnectionId) -> Result<Peripheral> {
        self.connections
            .read()
            .get(&connection)
            .map(|c| c.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Turn a scan event into an advertisement, if it concerns a peripheral.
    async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let mut advertisement = Advertisement::new(id.to_string())
            .with_address(properties.address.to_string());
        advertisement.name = properties.local_name;
        advertisement.service_uuids = properties.services;
        advertisement.rssi = properties.rssi;
        Some(advertisement)
    }

    /// Forward advertisements until the scan is stopped.
    async fn forward_scan_events(
        adapter: Adapter,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        sink: AdapterEventSink,
    ) {
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                    warn!("Adapter powered off during scan");
                    sink.send(AdapterEvent::ScanFailed(-1));
                    break;
                }
                _ => continue,
            };

            if let Some(advertisement) = Self::advertisement_for(&adapter, &id).await {
                trace!("Advertisement from {}", advertisement.label());
                sink.send(AdapterEvent::Advertisement(advertisement));
            }

            if sink.is_closed() {
                break;
            }
        }

        debug!("Scan event loop ended");
    }
}

#[async_trait]
impl BleAdapter for PlatformAdapter {
    fn has_permission(&self, _capabilities: &[Capability]) -> bool {
        true
    }

    async fn request_permission(&self, _capabilities: &[Capability]) -> PermissionOutcome {
        PermissionOutcome::Granted
    }

    fn is_adapter_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, sink: AdapterEventSink) -> Result<ScanHandle> {
        info!("Starting BLE scan for RFID reader");

        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let id = self.next_id();
        let task = tokio::spawn(Self::forward_scan_events(
            self.adapter.clone(),
            events,
            sink,
        ));
        self.scans.write().insert(id, task);

        Ok(ScanHandle::new(id))
    }

    async fn stop_scan(&self, scan: ScanHandle) -> Result<()> {
        let task = self.scans.write().remove(&scan.id());
        let task = match task {
            Some(task) => task,
            None => {
                debug!("Scan {} not running, ignoring stop request", scan.id());
                return Ok(());
            }
        };

        info!("Stopping BLE scan");
        task.abort();

        let idle = self.scans.read().is_empty();
        if idle {
            self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;
        }

        Ok(())
    }

    async fn connect(&self, device_id: &str, sink: AdapterEventSink) -> Result<ConnectionHandle> {
        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device_id.to_string(),
            })?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| Error::ConnectionFailed {
                    reason: e.to_string(),
                })?;
        }

        let id = ConnectionId(self.next_id());
        info!("Successfully connected to {} as {}", device_id, id);

        let mut tasks = Vec::with_capacity(2);

        // Notifications
        match peripheral.notifications().await {
            Ok(mut notifications) => {
                let sink = sink.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(notification) = notifications.next().await {
                        trace!(
                            "Notification from {}: {} bytes",
                            notification.uuid,
                            notification.value.len()
                        );
                        sink.send(AdapterEvent::CharacteristicChanged {
                            connection: id,
                            characteristic: notification.uuid,
                            value: Bytes::from(notification.value),
                        });
                    }
                    debug!("Notification listener stopped");
                }));
            }
            Err(e) => error!("Failed to get notifications stream: {}", e),
        }

        // Disconnects
        match self.adapter.events().await {
            Ok(mut events) => {
                let peripheral_id = peripheral.id();
                tasks.push(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(gone) = event {
                            if gone == peripheral_id {
                                debug!("Device disconnected: {:?}", gone);
                                sink.send(AdapterEvent::Disconnected(id));
                                break;
                            }
                        }
                    }
                }));
            }
            Err(e) => error!("Failed to get adapter events: {}", e),
        }

        self.connections
            .write()
            .insert(id, PlatformConnection { peripheral, tasks });

        Ok(ConnectionHandle::new(id, device_id))
    }

    async fn discover_services(&self, connection: ConnectionId) -> Result<ServiceMap> {
        let peripheral = self.peripheral(connection)?;
        peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let mut services = ServiceMap::new();
        for service in peripheral.services() {
            services.add_service(service.uuid);
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                services.add_characteristic(
                    service.uuid,
                    characteristic.uuid,
                    characteristic.descriptors.iter().map(|d| d.uuid),
                );
            }
        }

        Ok(services)
    }

    async fn enable_notification(&self, connection: ConnectionId, characteristic: Uuid) -> bool {
        let result: Result<()> = async {
            let peripheral = self.peripheral(connection)?;
            let characteristic = Self::find_characteristic(&peripheral, characteristic)?;
            peripheral
                .subscribe(&characteristic)
                .await
                .map_err(Error::Bluetooth)
        }
        .await;

        match result {
            Ok(()) => {
                debug!("Subscribed to notifications from {}", characteristic);
                true
            }
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", characteristic, e);
                false
            }
        }
    }

    async fn write_descriptor(
        &self,
        connection: ConnectionId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        let peripheral = self.peripheral(connection)?;
        let characteristic = Self::find_characteristic(&peripheral, characteristic)?;
        let descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .ok_or_else(|| Error::DescriptorNotFound {
                uuid: descriptor.to_string(),
            })?;

        peripheral
            .write_descriptor(descriptor, &value)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to descriptor {}", value.len(), descriptor.uuid);
        Ok(())
    }

    async fn read_characteristic(&self, connection: ConnectionId, characteristic: Uuid) -> Result<Bytes> {
        let peripheral = self.peripheral(connection)?;
        let characteristic = Self::find_characteristic(&peripheral, characteristic)?;
        let data = peripheral
            .read(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from characteristic {}", data.len(), characteristic.uuid);
        Ok(Bytes::from(data))
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<()> {
        let entry = self.connections.write().remove(&connection.id());
        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(()),
        };

        for task in &entry.tasks {
            task.abort();
        }

        match entry.peripheral.disconnect().await {
            Ok(_) => {
                info!("Successfully disconnected from {}", connection.device_id());
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }
}

impl Drop for PlatformAdapter {
    fn drop(&mut self) {
        if let Some(watcher) = self.state_watcher.take() {
            watcher.abort();
        }
        for (_, task) in self.scans.write().drain() {
            task.abort();
        }
        for (_, connection) in self.connections.write().drain() {
            for task in connection.tasks {
                task.abort();
            }
        }
    }
}
