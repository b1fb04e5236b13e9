//! The RFID UID session.
//!
//! [`BleUidSession`] runs a [`SessionMachine`] on a background task. Caller
//! requests, adapter outcomes, adapter events and the scan timer are all fed
//! to the machine one at a time; the commands it returns are executed against
//! the [`BleAdapter`] in order.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ble::adapter::{
    AdapterEvent, AdapterEventSink, BleAdapter, Capability, ALL_CAPABILITIES,
};
use crate::ble::advertising::Advertisement;
use crate::error::{Error, Result};
use crate::session::{
    Command, DeviceSighting, FailureReason, Preflight, SessionConfig, SessionEvent,
    SessionMachine, SessionSnapshot, SessionState, UidValue,
};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Change notification published by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The session entered a new phase.
    State(SessionState),
    /// The status text changed.
    Status(String),
    /// A UID value arrived, possibly the same as the last one.
    Uid(UidValue),
    /// The sighting list changed.
    Sightings(Vec<DeviceSighting>),
    /// The session is asking the platform for these capabilities.
    PermissionRequested(Vec<Capability>),
}

/// Messages to the event loop.
enum Message {
    Event(SessionEvent),
    Shutdown,
}

/// Shared between the session handle and its event loop.
struct Shared {
    snapshot: RwLock<SessionSnapshot>,
    update_tx: broadcast::Sender<SessionUpdate>,
}

impl Shared {
    /// Store a new snapshot and publish whatever changed.
    ///
    /// `uid_received` publishes the UID even when it repeats the last one.
    fn publish(&self, next: SessionSnapshot, uid_received: bool) {
        let previous = std::mem::replace(&mut *self.snapshot.write(), next.clone());

        if previous.sightings != next.sightings {
            let _ = self.update_tx.send(SessionUpdate::Sightings(next.sightings));
        }
        if previous.state != next.state {
            let _ = self.update_tx.send(SessionUpdate::State(next.state));
        }
        if previous.status != next.status {
            debug!("Status: {}", next.status);
            let _ = self.update_tx.send(SessionUpdate::Status(next.status));
        }
        if uid_received || previous.uid != next.uid {
            let _ = self.update_tx.send(SessionUpdate::Uid(next.uid));
        }
    }
}

/// A session that finds the RFID reader and streams tag UIDs from it.
///
/// `start()` and `stop()` return immediately; progress is observed through
/// [`subscribe`](Self::subscribe), the `on_*` callbacks or
/// [`snapshot`](Self::snapshot).
pub struct BleUidSession {
    adapter: Arc<dyn BleAdapter>,
    config: SessionConfig,
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Message>,
    worker: RwLock<Option<JoinHandle<()>>>,
    callback_counter: AtomicU64,
}

impl BleUidSession {
    /// Create a session with the default reader configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a Tokio runtime.
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Result<Self> {
        Self::with_config(adapter, SessionConfig::default())
    }

    /// Create a session with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a Tokio runtime.
    pub fn with_config(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no Tokio runtime: {}", e)))?;

        let machine = SessionMachine::new(config.clone());
        let (update_tx, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(machine.snapshot()),
            update_tx,
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            adapter: adapter.clone(),
            machine,
            shared: shared.clone(),
            control_tx: control_tx.clone(),
            sink: AdapterEventSink::new(adapter_tx),
            timer: None,
            batches: Vec::new(),
        };
        let worker = runtime.spawn(event_loop.run(control_rx, adapter_rx));

        Ok(Self {
            adapter,
            config,
            shared,
            control_tx,
            worker: RwLock::new(Some(worker)),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Begin an attempt: request permission if needed, then scan, connect and
    /// subscribe.
    ///
    /// Ignored while an attempt is already in progress.
    pub fn start(&self) -> Result<()> {
        let preflight = Preflight {
            has_permission: self.adapter.has_permission(ALL_CAPABILITIES),
            adapter_enabled: self.adapter.is_adapter_enabled(),
        };
        debug!("Start requested: {:?}", preflight);
        self.send(SessionEvent::Start(preflight))
    }

    /// Stop scanning, close any connection and return to `Idle`.
    ///
    /// Safe to call in any state, any number of times.
    pub fn stop(&self) -> Result<()> {
        self.send(SessionEvent::Stop)
    }

    /// Alias for [`stop`](Self::stop).
    pub fn cancel(&self) -> Result<()> {
        self.stop()
    }

    /// Stop the session and wait for its resources to be released.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down UID session");

        let worker = self.worker.write().take();
        let worker = match worker {
            Some(worker) => worker,
            None => return Ok(()),
        };

        if self.control_tx.send(Message::Shutdown).is_err() {
            warn!("Event loop already gone");
        }
        worker
            .await
            .map_err(|e| Error::Internal(format!("event loop panicked: {}", e)))
    }

    /// Get a copy of the observable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.read().clone()
    }

    /// Get the current phase.
    pub fn state(&self) -> SessionState {
        self.shared.snapshot.read().state.clone()
    }

    /// Get the current status text.
    pub fn status(&self) -> String {
        self.shared.snapshot.read().status.clone()
    }

    /// Get the latest UID.
    pub fn uid(&self) -> UidValue {
        self.shared.snapshot.read().uid.clone()
    }

    /// Get the devices seen during the current or last scan.
    pub fn sightings(&self) -> Vec<DeviceSighting> {
        self.shared.snapshot.read().sightings.clone()
    }

    /// Get the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session updates.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.update_tx.subscribe()
    }

    /// Register a callback for status text changes.
    pub fn on_status_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionUpdate::Status(status)) => callback(&status),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Status callback lagged by {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for UID values.
    ///
    /// Called for every value the reader sends, so presenting the same tag
    /// twice calls it twice.
    pub fn on_uid_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&UidValue) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionUpdate::Uid(uid)) => callback(&uid),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("UID callback lagged by {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        self.control_tx
            .send(Message::Event(event))
            .map_err(|_| Error::SessionClosed)
    }
}

impl Drop for BleUidSession {
    fn drop(&mut self) {
        // The loop releases the scan and connection before exiting.
        let _ = self.control_tx.send(Message::Shutdown);
    }
}

/// Owns the machine; runs on its own task.
struct EventLoop {
    adapter: Arc<dyn BleAdapter>,
    machine: SessionMachine,
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Message>,
    sink: AdapterEventSink,
    timer: Option<JoinHandle<()>>,
    /// Adapter batches still running; each returns the outcomes it could
    /// not deliver.
    batches: Vec<JoinHandle<Vec<SessionEvent>>>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Message>,
        mut adapter_rx: mpsc::UnboundedReceiver<AdapterEvent>,
    ) {
        debug!("Session event loop started");

        loop {
            tokio::select! {
                message = control_rx.recv() => match message {
                    Some(Message::Event(event)) => self.dispatch(event),
                    Some(Message::Shutdown) | None => break,
                },
                Some(event) = adapter_rx.recv() => self.on_adapter_event(event),
            }
        }

        // Release whatever is still held before the loop goes away. Batches
        // still in flight are awaited so handles they return are not lost.
        control_rx.close();
        let mut commands = self.machine.handle(SessionEvent::Stop);

        let mut outcomes = Vec::new();
        while let Ok(message) = control_rx.try_recv() {
            if let Message::Event(event) = message {
                outcomes.push(event);
            }
        }

        loop {
            for event in outcomes.drain(..) {
                if matches!(
                    event,
                    SessionEvent::ScanStarted { .. } | SessionEvent::Connected { .. }
                ) {
                    commands.extend(self.machine.handle(event));
                }
            }
            self.shared.publish(self.machine.snapshot(), false);

            let batch = self.split_timer_commands(std::mem::take(&mut commands));
            if !batch.is_empty() {
                self.batches.push(tokio::spawn(run_batch(
                    self.adapter.clone(),
                    batch,
                    self.control_tx.clone(),
                    self.sink.clone(),
                )));
            }

            match self.batches.pop() {
                Some(batch) => match batch.await {
                    Ok(undelivered) => outcomes = undelivered,
                    Err(e) => warn!("Adapter batch did not finish: {}", e),
                },
                None => break,
            }
        }

        debug!("Session event loop ended");
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Advertisement(advertisement) => self.on_advertisement(advertisement),
            AdapterEvent::AdvertisementBatch(batch) => {
                for advertisement in batch {
                    self.on_advertisement(advertisement);
                }
            }
            AdapterEvent::ScanFailed(code) => self.dispatch(SessionEvent::ScanFailed(code)),
            AdapterEvent::Disconnected(connection) => {
                self.dispatch(SessionEvent::Disconnected(connection))
            }
            AdapterEvent::CharacteristicChanged {
                connection,
                characteristic,
                value,
            } => self.dispatch(SessionEvent::CharacteristicValue {
                connection,
                characteristic,
                value,
            }),
        }
    }

    fn on_advertisement(&mut self, advertisement: Advertisement) {
        if !self.machine.state().is_scanning() {
            return;
        }
        let connect_permitted = self.adapter.has_permission(&[Capability::Connect]);
        self.dispatch(SessionEvent::Advertisement {
            advertisement,
            connect_permitted,
        });
    }

    /// Feed one event to the machine and start executing its commands.
    fn dispatch(&mut self, event: SessionEvent) {
        let uid_updates = self.machine.uid_updates();
        let commands = self.machine.handle(event);
        self.shared.publish(
            self.machine.snapshot(),
            self.machine.uid_updates() != uid_updates,
        );

        if commands.is_empty() {
            return;
        }

        let batch = self.split_timer_commands(commands);
        if batch.is_empty() {
            return;
        }

        if batch.contains(&Command::RequestPermission) {
            let _ = self
                .shared
                .update_tx
                .send(SessionUpdate::PermissionRequested(ALL_CAPABILITIES.to_vec()));
        }

        self.batches.retain(|batch| !batch.is_finished());
        self.batches.push(tokio::spawn(run_batch(
            self.adapter.clone(),
            batch,
            self.control_tx.clone(),
            self.sink.clone(),
        )));
    }

    /// Handle timer commands in place; return the adapter commands.
    fn split_timer_commands(&mut self, commands: Vec<Command>) -> Vec<Command> {
        let mut batch = Vec::with_capacity(commands.len());

        for command in commands {
            match command {
                Command::ArmScanTimeout { attempt, after } => {
                    self.cancel_timer();
                    let control_tx = self.control_tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = control_tx.send(Message::Event(SessionEvent::ScanTimeout { attempt }));
                    }));
                }
                Command::CancelScanTimeout => self.cancel_timer(),
                other => batch.push(other),
            }
        }

        batch
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Map a scan start error onto the failure shown to the user.
fn scan_failure(error: &Error) -> FailureReason {
    match error {
        Error::PermissionDenied => FailureReason::PermissionDenied,
        Error::BluetoothUnavailable => FailureReason::AdapterDisabled,
        Error::ScanFailed { code } => FailureReason::ScanFailed(*code),
        _ => FailureReason::ScanFailed(-1),
    }
}

/// Execute adapter commands in order, posting outcomes back to the loop.
///
/// Returns the outcomes that could not be posted because the loop is
/// shutting down.
async fn run_batch(
    adapter: Arc<dyn BleAdapter>,
    commands: Vec<Command>,
    control_tx: mpsc::UnboundedSender<Message>,
    sink: AdapterEventSink,
) -> Vec<SessionEvent> {
    let mut undelivered = Vec::new();
    let mut post = |event: SessionEvent| {
        if let Err(mpsc::error::SendError(Message::Event(event))) =
            control_tx.send(Message::Event(event))
        {
            debug!("Session loop closed, returning outcome");
            undelivered.push(event);
        }
    };

    for command in commands {
        match command {
            Command::RequestPermission => {
                let outcome = adapter.request_permission(ALL_CAPABILITIES).await;
                info!("Permission request answered: {:?}", outcome);
                post(SessionEvent::PermissionResult {
                    outcome,
                    adapter_enabled: adapter.is_adapter_enabled(),
                });
            }
            Command::StartScan { attempt } => {
                debug!("Starting scan for attempt {}", attempt);
                match adapter.start_scan(sink.clone()).await {
                    Ok(handle) => post(SessionEvent::ScanStarted { attempt, handle }),
                    Err(e) => {
                        error!("Failed to start scan: {}", e);
                        post(SessionEvent::ScanStartFailed {
                            attempt,
                            reason: scan_failure(&e),
                        });
                    }
                }
            }
            Command::StopScan(handle) => {
                debug!("Stopping scan {}", handle.id());
                if let Err(e) = adapter.stop_scan(handle).await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Command::Connect { attempt, device_id } => {
                info!("Connecting to {}", device_id);
                match adapter.connect(&device_id, sink.clone()).await {
                    Ok(handle) => post(SessionEvent::Connected { attempt, handle }),
                    Err(e) => {
                        error!("Failed to connect to {}: {}", device_id, e);
                        post(SessionEvent::ConnectFailed {
                            attempt,
                            reason: FailureReason::from(&e),
                        });
                    }
                }
            }
            Command::DiscoverServices(connection) => {
                match adapter.discover_services(connection).await {
                    Ok(services) => {
                        debug!("Discovered {} services", services.service_count());
                        post(SessionEvent::ServicesDiscovered {
                            connection,
                            services,
                        });
                    }
                    Err(e) => {
                        error!("Service discovery failed: {}", e);
                        post(SessionEvent::DiscoveryFailed {
                            connection,
                            reason: FailureReason::from(&e),
                        });
                    }
                }
            }
            Command::EnableNotification {
                connection,
                characteristic,
            } => {
                let enabled = adapter.enable_notification(connection, characteristic).await;
                post(SessionEvent::NotificationEnabled {
                    connection,
                    enabled,
                });
            }
            Command::WriteDescriptor {
                connection,
                characteristic,
                descriptor,
                value,
            } => {
                let result = adapter
                    .write_descriptor(connection, characteristic, descriptor, value)
                    .await;
                if let Err(e) = &result {
                    warn!("Descriptor write failed: {}", e);
                }
                post(SessionEvent::DescriptorWritten {
                    connection,
                    ok: result.is_ok(),
                });
            }
            Command::ReadCharacteristic {
                connection,
                characteristic,
            } => match adapter.read_characteristic(connection, characteristic).await {
                Ok(value) => post(SessionEvent::CharacteristicValue {
                    connection,
                    characteristic,
                    value,
                }),
                Err(e) => warn!("Initial UID read failed: {}", e),
            },
            Command::Disconnect(handle) => {
                debug!("Closing connection {}", handle.id());
                if let Err(e) = adapter.disconnect(handle).await {
                    warn!("Failed to disconnect: {}", e);
                }
            }
            Command::ArmScanTimeout { .. } | Command::CancelScanTimeout => {
                // Handled by the event loop.
            }
        }
    }

    undelivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{MockBleAdapter, PermissionOutcome, ScanHandle};
    use std::time::Duration;

    async fn wait_for_state(session: &BleUidSession, expected: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_requires_runtime() {
        let adapter = MockBleAdapter::new();
        assert!(matches!(
            BleUidSession::new(Arc::new(adapter)),
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_adapter_disabled_never_scans() {
        let mut adapter = MockBleAdapter::new();
        adapter.expect_has_permission().return_const(true);
        adapter.expect_is_adapter_enabled().return_const(false);
        adapter.expect_start_scan().never();

        let session = BleUidSession::new(Arc::new(adapter)).unwrap();
        session.start().unwrap();

        wait_for_state(
            &session,
            SessionState::Failed {
                reason: FailureReason::AdapterDisabled,
            },
        )
        .await;
        assert_eq!(session.status(), "Bluetooth is off");
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied_never_scans() {
        let mut adapter = MockBleAdapter::new();
        adapter.expect_has_permission().return_const(false);
        adapter.expect_is_adapter_enabled().return_const(true);
        adapter
            .expect_request_permission()
            .times(1)
            .return_const(PermissionOutcome::Denied);
        adapter.expect_start_scan().never();

        let session = BleUidSession::new(Arc::new(adapter)).unwrap();
        let mut updates = session.subscribe();
        session.start().unwrap();

        wait_for_state(
            &session,
            SessionState::Failed {
                reason: FailureReason::PermissionDenied,
            },
        )
        .await;

        let mut saw_request = false;
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::PermissionRequested(capabilities) = update {
                assert_eq!(capabilities, vec![Capability::Scan, Capability::Connect]);
                saw_request = true;
            }
        }
        assert!(saw_request);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_scan() {
        let mut adapter = MockBleAdapter::new();
        adapter.expect_has_permission().return_const(true);
        adapter.expect_is_adapter_enabled().return_const(true);
        adapter
            .expect_start_scan()
            .times(1)
            .returning(|_| Ok(ScanHandle::new(11)));
        adapter
            .expect_stop_scan()
            .withf(|handle| handle.id() == 11)
            .times(1)
            .returning(|_| Ok(()));

        let session = BleUidSession::new(Arc::new(adapter)).unwrap();
        session.start().unwrap();
        wait_for_state(&session, SessionState::Scanning).await;

        // Let the scan handle reach the machine.
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(session.start(), Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_status_callback() {
        let mut adapter = MockBleAdapter::new();
        adapter.expect_has_permission().return_const(true);
        adapter.expect_is_adapter_enabled().return_const(true);
        adapter
            .expect_start_scan()
            .returning(|sink| {
                sink.send(AdapterEvent::Advertisement(
                    Advertisement::new("a").with_name("Kettle"),
                ));
                Ok(ScanHandle::new(1))
            });
        adapter.expect_stop_scan().returning(|_| Ok(()));

        let session = BleUidSession::new(Arc::new(adapter)).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen_cb = seen.clone();
        let _handle = session.on_status_changed(move |status| {
            seen_cb.lock().push(status.to_string());
        });

        session.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.lock().iter().any(|s| s == "Scanning... Found: Kettle") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.lock()[0], "Scanning...");
        session.shutdown().await.unwrap();
    }

    #[test]
    fn test_scan_failure_mapping() {
        assert_eq!(
            scan_failure(&Error::PermissionDenied),
            FailureReason::PermissionDenied
        );
        assert_eq!(
            scan_failure(&Error::ScanFailed { code: 3 }),
            FailureReason::ScanFailed(3)
        );
        assert_eq!(
            scan_failure(&Error::Internal("x".to_string())),
            FailureReason::ScanFailed(-1)
        );
    }
}
