//! Shared test helpers: an in-memory adapter and polling utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rfid_uid_ble::ble::uuids::{CCCD_UUID, RFID_SERVICE_UUID, UID_CHARACTERISTIC_UUID};
use rfid_uid_ble::{
    AdapterEvent, AdapterEventSink, Advertisement, BleAdapter, BleUidSession, Capability,
    ConnectionHandle, ConnectionId, Error, PermissionOutcome, Result, ScanHandle, ServiceMap,
    SessionState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Services exposed by a well-behaved reader.
pub fn reader_services() -> ServiceMap {
    let mut services = ServiceMap::new();
    services.add_characteristic(RFID_SERVICE_UUID, UID_CHARACTERISTIC_UUID, [CCCD_UUID]);
    services
}

struct FakeState {
    permission: bool,
    grant: PermissionOutcome,
    enabled: bool,
    services: ServiceMap,
    connect_error: Option<String>,
    initial_uid: Bytes,
    scans: HashMap<u64, AdapterEventSink>,
    connections: HashMap<ConnectionId, AdapterEventSink>,
    start_scan_calls: usize,
    disconnect_calls: usize,
    connected_to: Vec<String>,
    descriptor_writes: Vec<Vec<u8>>,
    scan_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    advertise_on_scan: Option<Advertisement>,
    drop_on_connect: bool,
    scans_at_connect: Vec<usize>,
}

/// Adapter whose radio is a few hash maps.
pub struct FakeAdapter {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                permission: true,
                grant: PermissionOutcome::Granted,
                enabled: true,
                services: reader_services(),
                connect_error: None,
                initial_uid: Bytes::new(),
                scans: HashMap::new(),
                connections: HashMap::new(),
                start_scan_calls: 0,
                disconnect_calls: 0,
                connected_to: Vec::new(),
                descriptor_writes: Vec::new(),
                scan_delay: None,
                connect_delay: None,
                advertise_on_scan: None,
                drop_on_connect: false,
                scans_at_connect: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn without_permission(self, grant: PermissionOutcome) -> Self {
        {
            let mut state = self.state.lock();
            state.permission = false;
            state.grant = grant;
        }
        self
    }

    pub fn disabled(self) -> Self {
        self.state.lock().enabled = false;
        self
    }

    pub fn with_services(self, services: ServiceMap) -> Self {
        self.state.lock().services = services;
        self
    }

    pub fn with_connect_error(self, reason: &str) -> Self {
        self.state.lock().connect_error = Some(reason.to_string());
        self
    }

    pub fn with_initial_uid(self, value: &'static [u8]) -> Self {
        self.state.lock().initial_uid = Bytes::from_static(value);
        self
    }

    /// Make `start_scan` take `delay` before returning.
    pub fn with_scan_delay(self, delay: Duration) -> Self {
        self.state.lock().scan_delay = Some(delay);
        self
    }

    /// Make `connect` take `delay` before returning.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = Some(delay);
        self
    }

    /// Push `advertisement` from inside `start_scan`, before it returns.
    pub fn advertising_on_scan(self, advertisement: Advertisement) -> Self {
        self.state.lock().advertise_on_scan = Some(advertisement);
        self
    }

    /// Report the link lost from inside `connect`, before it returns.
    pub fn dropping_link_on_connect(self) -> Self {
        self.state.lock().drop_on_connect = true;
        self
    }

    /// Deliver an advertisement to every running scan.
    pub fn advertise(&self, advertisement: Advertisement) {
        for sink in self.state.lock().scans.values() {
            sink.send(AdapterEvent::Advertisement(advertisement.clone()));
        }
    }

    /// Deliver a batch of advertisements to every running scan.
    pub fn advertise_batch(&self, batch: Vec<Advertisement>) {
        for sink in self.state.lock().scans.values() {
            sink.send(AdapterEvent::AdvertisementBatch(batch.clone()));
        }
    }

    /// Push a UID notification on every open connection.
    pub fn notify_uid(&self, value: &'static [u8]) {
        for (connection, sink) in self.state.lock().connections.iter() {
            sink.send(AdapterEvent::CharacteristicChanged {
                connection: *connection,
                characteristic: UID_CHARACTERISTIC_UUID,
                value: Bytes::from_static(value),
            });
        }
    }

    /// Report every open connection as lost, `times` times each.
    pub fn drop_connections(&self, times: usize) {
        for (connection, sink) in self.state.lock().connections.iter() {
            for _ in 0..times {
                sink.send(AdapterEvent::Disconnected(*connection));
            }
        }
    }

    pub fn active_scans(&self) -> usize {
        self.state.lock().scans.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn start_scan_calls(&self) -> usize {
        self.state.lock().start_scan_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn connected_to(&self) -> Vec<String> {
        self.state.lock().connected_to.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().descriptor_writes.clone()
    }

    /// Running scans observed at each `connect` call.
    pub fn scans_at_connect(&self) -> Vec<usize> {
        self.state.lock().scans_at_connect.clone()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    fn has_permission(&self, _capabilities: &[Capability]) -> bool {
        self.state.lock().permission
    }

    async fn request_permission(&self, _capabilities: &[Capability]) -> PermissionOutcome {
        let mut state = self.state.lock();
        if state.grant.is_granted() {
            state.permission = true;
        }
        state.grant
    }

    fn is_adapter_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    async fn start_scan(&self, sink: AdapterEventSink) -> Result<ScanHandle> {
        let delay = self.state.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id();
        let mut state = self.state.lock();
        state.start_scan_calls += 1;
        if let Some(advertisement) = state.advertise_on_scan.clone() {
            sink.send(AdapterEvent::Advertisement(advertisement));
        }
        state.scans.insert(id, sink);
        Ok(ScanHandle::new(id))
    }

    async fn stop_scan(&self, scan: ScanHandle) -> Result<()> {
        self.state.lock().scans.remove(&scan.id());
        Ok(())
    }

    async fn connect(&self, device_id: &str, sink: AdapterEventSink) -> Result<ConnectionHandle> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = ConnectionId(self.next_id());
        let mut state = self.state.lock();
        let live_scans = state.scans.len();
        state.scans_at_connect.push(live_scans);
        state.connected_to.push(device_id.to_string());
        if let Some(reason) = state.connect_error.clone() {
            return Err(Error::ConnectionFailed { reason });
        }
        if state.drop_on_connect {
            sink.send(AdapterEvent::Disconnected(id));
        }
        state.connections.insert(id, sink);
        Ok(ConnectionHandle::new(id, device_id))
    }

    async fn discover_services(&self, connection: ConnectionId) -> Result<ServiceMap> {
        let state = self.state.lock();
        if !state.connections.contains_key(&connection) {
            return Err(Error::NotConnected);
        }
        Ok(state.services.clone())
    }

    async fn enable_notification(&self, connection: ConnectionId, _characteristic: Uuid) -> bool {
        self.state.lock().connections.contains_key(&connection)
    }

    async fn write_descriptor(
        &self,
        _connection: ConnectionId,
        _characteristic: Uuid,
        _descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        self.state.lock().descriptor_writes.push(value);
        Ok(())
    }

    async fn read_characteristic(
        &self,
        _connection: ConnectionId,
        _characteristic: Uuid,
    ) -> Result<Bytes> {
        Ok(self.state.lock().initial_uid.clone())
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.connections.remove(&connection.id());
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// Wait until the session reaches `expected`.
pub async fn wait_for_state(session: &BleUidSession, expected: SessionState) {
    let what = format!("state {:?}", expected);
    eventually(&what, || session.state() == expected).await;
}

/// Advertisement from the reader, matched by name.
pub fn reader(device_id: &str) -> Advertisement {
    Advertisement::new(device_id)
        .with_name("ESP32-RFID-01")
        .with_rssi(-60)
}
