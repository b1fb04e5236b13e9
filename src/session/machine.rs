//! The discovery-and-subscription state machine.
//!
//! [`SessionMachine`] is a pure transition function: it consumes one
//! [`SessionEvent`] at a time and returns the [`Command`]s the driver has to
//! run against the adapter, in order. It owns the scan and connection handles
//! while they are live and hands them back inside `StopScan`/`Disconnect`
//! commands, so each resource is released exactly once.
//!
//! Every adapter request is tagged with the attempt number that issued it.
//! Outcomes from an older attempt (or arriving after the session moved on)
//! are dropped, and any handle they carry is released straight away.

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{ConnectionHandle, ConnectionId, PermissionOutcome, ScanHandle, ServiceMap};
use crate::ble::advertising::Advertisement;
use crate::ble::uuids::ENABLE_NOTIFICATION_VALUE;
use crate::session::config::SessionConfig;
use crate::session::sightings::{DeviceSighting, SightingList};
use crate::session::state::{FailureReason, SessionState};
use crate::session::uid::UidValue;

/// What the caller or platform knew when `start()` was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    /// Scan and connect capabilities are already granted.
    pub has_permission: bool,
    /// The radio is powered on.
    pub adapter_enabled: bool,
}

/// Input to the state machine.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    /// Caller asked to begin an attempt.
    Start(Preflight),
    /// Caller asked to stop/cancel.
    Stop,
    /// Platform answered a permission request.
    PermissionResult {
        /// Grant or deny.
        outcome: PermissionOutcome,
        /// Radio state at the time of the answer.
        adapter_enabled: bool,
    },
    /// The adapter began scanning.
    ScanStarted {
        /// Attempt that requested the scan.
        attempt: u64,
        /// Ownership of the running scan.
        handle: ScanHandle,
    },
    /// The adapter refused to begin scanning.
    ScanStartFailed {
        /// Attempt that requested the scan.
        attempt: u64,
        /// Why.
        reason: FailureReason,
    },
    /// An advertisement arrived.
    Advertisement {
        /// The advertisement.
        advertisement: Advertisement,
        /// Whether the connect capability is currently granted.
        connect_permitted: bool,
    },
    /// The running scan failed.
    ScanFailed(i32),
    /// The scan timer fired.
    ScanTimeout {
        /// Attempt that armed the timer.
        attempt: u64,
    },
    /// A connection was opened.
    Connected {
        /// Attempt that requested the connection.
        attempt: u64,
        /// Ownership of the connection.
        handle: ConnectionHandle,
    },
    /// A connection could not be opened.
    ConnectFailed {
        /// Attempt that requested the connection.
        attempt: u64,
        /// Why.
        reason: FailureReason,
    },
    /// The peripheral behind a connection went away.
    Disconnected(ConnectionId),
    /// Service discovery finished.
    ServicesDiscovered {
        /// Connection the discovery ran on.
        connection: ConnectionId,
        /// What was found.
        services: ServiceMap,
    },
    /// Service discovery failed.
    DiscoveryFailed {
        /// Connection the discovery ran on.
        connection: ConnectionId,
        /// Why.
        reason: FailureReason,
    },
    /// The notification flag was set (or not).
    NotificationEnabled {
        /// Connection.
        connection: ConnectionId,
        /// Whether the adapter accepted the request.
        enabled: bool,
    },
    /// The notification descriptor write completed.
    DescriptorWritten {
        /// Connection.
        connection: ConnectionId,
        /// Whether the write succeeded.
        ok: bool,
    },
    /// A characteristic value arrived by notification or read.
    CharacteristicValue {
        /// Connection.
        connection: ConnectionId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Raw value.
        value: Bytes,
    },
}

/// Work for the driver. Run in the order returned.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Ask the platform for scan/connect capabilities.
    RequestPermission,
    /// Begin an unfiltered scan.
    StartScan {
        /// Attempt number to echo back.
        attempt: u64,
    },
    /// Stop a scan.
    StopScan(ScanHandle),
    /// Schedule a `ScanTimeout` for `attempt` after `after`.
    ArmScanTimeout {
        /// Attempt number to echo back.
        attempt: u64,
        /// Delay.
        after: Duration,
    },
    /// Discard the pending scan timer.
    CancelScanTimeout,
    /// Open a connection.
    Connect {
        /// Attempt number to echo back.
        attempt: u64,
        /// Device to connect to.
        device_id: String,
    },
    /// Discover services.
    DiscoverServices(ConnectionId),
    /// Set the notification flag on a characteristic.
    EnableNotification {
        /// Connection.
        connection: ConnectionId,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Write a descriptor.
    WriteDescriptor {
        /// Connection.
        connection: ConnectionId,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
        /// Value to write.
        value: Vec<u8>,
    },
    /// Read a characteristic.
    ReadCharacteristic {
        /// Connection.
        connection: ConnectionId,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Close a connection.
    Disconnect(ConnectionHandle),
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionSnapshot {
    /// Current phase.
    pub state: SessionState,
    /// Human-readable status.
    pub status: String,
    /// Latest UID.
    pub uid: UidValue,
    /// Devices seen during the current or last scan.
    pub sightings: Vec<DeviceSighting>,
}

/// Scan ownership.
#[derive(Debug)]
enum ScanSlot {
    Idle,
    /// Requested, handle not yet returned.
    Starting,
    Running(ScanHandle),
}

/// The pure session state machine.
#[derive(Debug)]
pub struct SessionMachine {
    config: SessionConfig,
    state: SessionState,
    uid: UidValue,
    sightings: SightingList,
    scan: ScanSlot,
    connection: Option<ConnectionHandle>,
    attempt: u64,
    timer_armed: bool,
    notification_enabled: Option<bool>,
    awaiting_descriptor_write: bool,
    /// Device to connect to once the starting scan's handle is back.
    pending_connect: Option<String>,
    /// Links reported lost before their `Connected` outcome arrived.
    early_disconnects: Vec<ConnectionId>,
    uid_updates: u64,
}

impl SessionMachine {
    /// Create an idle machine.
    pub fn new(config: SessionConfig) -> Self {
        let sightings = SightingList::new(config.sighting_cap);
        Self {
            config,
            state: SessionState::Idle,
            uid: UidValue::default(),
            sightings,
            scan: ScanSlot::Idle,
            connection: None,
            attempt: 0,
            timer_armed: false,
            notification_enabled: None,
            awaiting_descriptor_write: false,
            pending_connect: None,
            early_disconnects: Vec::new(),
            uid_updates: 0,
        }
    }

    /// Current phase.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Latest UID.
    pub fn uid(&self) -> &UidValue {
        &self.uid
    }

    /// Sightings of the current or last scan.
    pub fn sightings(&self) -> &SightingList {
        &self.sightings
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current attempt number.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Check if a scan is requested or running.
    pub fn is_scan_active(&self) -> bool {
        !matches!(self.scan, ScanSlot::Idle)
    }

    /// Number of UID values received so far, including repeats.
    pub fn uid_updates(&self) -> u64 {
        self.uid_updates
    }

    /// Check if a connection handle is held.
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Check if the scan timer is armed.
    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed
    }

    /// Human-readable status for the current state.
    pub fn status(&self) -> String {
        match &self.state {
            SessionState::Scanning if !self.sightings.is_empty() => {
                format!("Scanning... Found: {}", self.sightings.joined())
            }
            SessionState::Disconnected {
                reason: FailureReason::Timeout,
            } => {
                if self.sightings.is_empty() {
                    "Not found. Tap to try again.".to_string()
                } else {
                    format!("Found: {} - no match yet", self.sightings.joined())
                }
            }
            state => state.to_string(),
        }
    }

    /// Copy of the observable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            status: self.status(),
            uid: self.uid.clone(),
            sightings: self.sightings.to_vec(),
        }
    }

    /// Apply one event and return the commands to run.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Command> {
        let mut commands = Vec::new();

        match event {
            SessionEvent::Start(preflight) => self.on_start(preflight, &mut commands),
            SessionEvent::Stop => self.on_stop(&mut commands),
            SessionEvent::PermissionResult {
                outcome,
                adapter_enabled,
            } => self.on_permission(outcome, adapter_enabled, &mut commands),
            SessionEvent::ScanStarted { attempt, handle } => {
                self.on_scan_started(attempt, handle, &mut commands)
            }
            SessionEvent::ScanStartFailed { attempt, reason } => {
                let starting = attempt == self.attempt && matches!(self.scan, ScanSlot::Starting);
                if starting && (self.state.is_scanning() || self.pending_connect.is_some()) {
                    warn!("Scan could not be started: {}", reason);
                    self.scan = ScanSlot::Idle;
                    self.pending_connect = None;
                    self.cancel_timer(&mut commands);
                    self.transition(SessionState::Failed { reason });
                }
            }
            SessionEvent::Advertisement {
                advertisement,
                connect_permitted,
            } => self.on_advertisement(advertisement, connect_permitted, &mut commands),
            SessionEvent::ScanFailed(code) => {
                if self.state.is_scanning() {
                    warn!("Scan failed with code {}", code);
                    self.halt_scan(&mut commands);
                    self.transition(SessionState::Failed {
                        reason: FailureReason::ScanFailed(code),
                    });
                }
            }
            SessionEvent::ScanTimeout { attempt } => {
                if attempt == self.attempt && self.state.is_scanning() {
                    info!(
                        "No matching device within {:?} ({} seen)",
                        self.config.scan_timeout,
                        self.sightings.len()
                    );
                    // The timer has fired; nothing left to cancel.
                    self.timer_armed = false;
                    self.halt_scan(&mut commands);
                    self.transition(SessionState::Disconnected {
                        reason: FailureReason::Timeout,
                    });
                } else {
                    trace!("Ignoring stale scan timeout for attempt {}", attempt);
                }
            }
            SessionEvent::Connected { attempt, handle } => {
                self.on_connected(attempt, handle, &mut commands)
            }
            SessionEvent::ConnectFailed { attempt, reason } => {
                if attempt == self.attempt && matches!(self.state, SessionState::Connecting { .. }) {
                    warn!("Connection attempt failed: {}", reason);
                    let next = if reason == FailureReason::ConnectionLost {
                        SessionState::Disconnected { reason }
                    } else {
                        SessionState::Failed { reason }
                    };
                    self.transition(next);
                }
            }
            SessionEvent::Disconnected(connection) => self.on_disconnected(connection, &mut commands),
            SessionEvent::ServicesDiscovered {
                connection,
                services,
            } => self.on_services(connection, services, &mut commands),
            SessionEvent::DiscoveryFailed { connection, reason } => {
                if self.is_current(connection) && self.state == SessionState::DiscoveringServices {
                    warn!("Service discovery failed: {}", reason);
                    self.fail_connected(reason, &mut commands);
                }
            }
            SessionEvent::NotificationEnabled {
                connection,
                enabled,
            } => {
                if self.is_current(connection) && self.state == SessionState::Subscribing {
                    debug!("Notification flag set: {}", enabled);
                    self.notification_enabled = Some(enabled);
                    if !self.awaiting_descriptor_write {
                        self.transition(SessionState::AwaitingUid {
                            subscribed: enabled,
                        });
                    }
                }
            }
            SessionEvent::DescriptorWritten { connection, ok } => {
                if self.is_current(connection) && self.state == SessionState::Subscribing {
                    debug!("Notification descriptor written: {}", ok);
                    self.awaiting_descriptor_write = false;
                    let subscribed = ok && self.notification_enabled.unwrap_or(false);
                    self.transition(SessionState::AwaitingUid { subscribed });
                }
            }
            SessionEvent::CharacteristicValue {
                connection,
                characteristic,
                value,
            } => {
                let receiving = matches!(
                    self.state,
                    SessionState::Subscribing | SessionState::AwaitingUid { .. }
                );
                if receiving
                    && self.is_current(connection)
                    && characteristic == self.config.fingerprint.uid_characteristic_id
                {
                    self.uid = UidValue::from_payload(&value);
                    self.uid_updates += 1;
                    info!("UID updated: {}", self.uid);
                }
            }
        }

        commands
    }

    fn on_start(&mut self, preflight: Preflight, commands: &mut Vec<Command>) {
        if !self.state.can_start() {
            debug!("Start ignored while {}", self.state.name());
            return;
        }

        if !preflight.has_permission {
            self.transition(SessionState::RequestingPermission);
            commands.push(Command::RequestPermission);
        } else if !preflight.adapter_enabled {
            self.transition(SessionState::Failed {
                reason: FailureReason::AdapterDisabled,
            });
        } else {
            self.begin_scan(commands);
        }
    }

    fn on_permission(
        &mut self,
        outcome: PermissionOutcome,
        adapter_enabled: bool,
        commands: &mut Vec<Command>,
    ) {
        if self.state != SessionState::RequestingPermission {
            debug!("Ignoring permission result while {}", self.state.name());
            return;
        }

        match outcome {
            PermissionOutcome::Denied => self.transition(SessionState::Failed {
                reason: FailureReason::PermissionDenied,
            }),
            PermissionOutcome::Granted if !adapter_enabled => self.transition(SessionState::Failed {
                reason: FailureReason::AdapterDisabled,
            }),
            PermissionOutcome::Granted => self.begin_scan(commands),
        }
    }

    fn begin_scan(&mut self, commands: &mut Vec<Command>) {
        self.attempt += 1;
        self.sightings.clear();
        self.pending_connect = None;
        self.early_disconnects.clear();
        self.scan = ScanSlot::Starting;
        self.timer_armed = true;
        self.transition(SessionState::Scanning);

        commands.push(Command::StartScan {
            attempt: self.attempt,
        });
        commands.push(Command::ArmScanTimeout {
            attempt: self.attempt,
            after: self.config.scan_timeout,
        });
    }

    fn on_scan_started(&mut self, attempt: u64, handle: ScanHandle, commands: &mut Vec<Command>) {
        let starting = attempt == self.attempt && matches!(self.scan, ScanSlot::Starting);
        if starting {
            if let Some(device_id) = self.pending_connect.take() {
                debug!("Scan {} ready, stopping it before connecting", handle.id());
                self.scan = ScanSlot::Idle;
                commands.push(Command::StopScan(handle));
                commands.push(Command::Connect { attempt, device_id });
                return;
            }
        }

        let wanted = attempt == self.attempt
            && self.state.is_scanning()
            && matches!(self.scan, ScanSlot::Starting);

        if wanted {
            debug!("Scan {} running", handle.id());
            self.scan = ScanSlot::Running(handle);
        } else {
            debug!("Stopping scan {} that is no longer wanted", handle.id());
            commands.push(Command::StopScan(handle));
        }
    }

    fn on_advertisement(
        &mut self,
        advertisement: Advertisement,
        connect_permitted: bool,
        commands: &mut Vec<Command>,
    ) {
        if !self.state.is_scanning() {
            return;
        }

        let label = advertisement.label();
        if self.sightings.record(&label, advertisement.received_at) {
            trace!("New sighting: {}", label);
        }

        let fingerprint = &self.config.fingerprint;
        if !advertisement.matches(&fingerprint.service_id, &self.config.name_substring) {
            return;
        }

        info!("Matched reader {} ({})", label, advertisement.device_id);

        // The scan must be stopped before connecting; wait for its handle.
        if connect_permitted && matches!(self.scan, ScanSlot::Starting) {
            self.cancel_timer(commands);
            self.pending_connect = Some(advertisement.device_id);
            self.transition(SessionState::Connecting { device: label });
            return;
        }

        self.halt_scan(commands);

        if connect_permitted {
            self.transition(SessionState::Connecting { device: label });
            commands.push(Command::Connect {
                attempt: self.attempt,
                device_id: advertisement.device_id,
            });
        } else {
            self.transition(SessionState::Failed {
                reason: FailureReason::PermissionDenied,
            });
        }
    }

    fn on_connected(&mut self, attempt: u64, handle: ConnectionHandle, commands: &mut Vec<Command>) {
        let wanted = attempt == self.attempt
            && matches!(self.state, SessionState::Connecting { .. })
            && self.connection.is_none();

        if !wanted {
            debug!("Closing connection {} that is no longer wanted", handle.id());
            commands.push(Command::Disconnect(handle));
            return;
        }

        let lost_early = self.early_disconnects.contains(&handle.id());
        self.early_disconnects.clear();
        if lost_early {
            info!("Link to {} dropped while connecting", handle.device_id());
            commands.push(Command::Disconnect(handle));
            self.transition(SessionState::Disconnected {
                reason: FailureReason::ConnectionLost,
            });
            return;
        }

        info!("Connected to {}", handle.device_id());
        let id = handle.id();
        self.connection = Some(handle);
        self.transition(SessionState::DiscoveringServices);
        commands.push(Command::DiscoverServices(id));
    }

    fn on_disconnected(&mut self, connection: ConnectionId, commands: &mut Vec<Command>) {
        if !self.is_current(connection) {
            let awaiting_handle =
                matches!(self.state, SessionState::Connecting { .. }) && self.connection.is_none();
            if awaiting_handle && !self.early_disconnects.contains(&connection) {
                debug!("Disconnect for {} before its connection completed", connection);
                self.early_disconnects.push(connection);
            } else {
                trace!("Disconnect for {} already handled", connection);
            }
            return;
        }

        info!("Peripheral disconnected");
        self.release_connection(commands);
        if self.state.is_connected_phase() {
            self.transition(SessionState::Disconnected {
                reason: FailureReason::ConnectionLost,
            });
        }
    }

    fn on_services(&mut self, connection: ConnectionId, services: ServiceMap, commands: &mut Vec<Command>) {
        if !self.is_current(connection) || self.state != SessionState::DiscoveringServices {
            return;
        }

        let fingerprint = self.config.fingerprint;
        if !services.has_service(&fingerprint.service_id) {
            self.fail_connected(FailureReason::ServiceNotFound, commands);
            return;
        }

        let characteristic = match services
            .characteristic(&fingerprint.service_id, &fingerprint.uid_characteristic_id)
        {
            Some(characteristic) => characteristic,
            None => {
                self.fail_connected(FailureReason::CharacteristicNotFound, commands);
                return;
            }
        };

        self.awaiting_descriptor_write = characteristic
            .descriptors
            .contains(&fingerprint.notification_descriptor_id);
        self.notification_enabled = None;
        self.transition(SessionState::Subscribing);

        commands.push(Command::EnableNotification {
            connection,
            characteristic: fingerprint.uid_characteristic_id,
        });
        if self.awaiting_descriptor_write {
            commands.push(Command::WriteDescriptor {
                connection,
                characteristic: fingerprint.uid_characteristic_id,
                descriptor: fingerprint.notification_descriptor_id,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            });
        } else {
            debug!("UID characteristic has no notification descriptor");
        }
        commands.push(Command::ReadCharacteristic {
            connection,
            characteristic: fingerprint.uid_characteristic_id,
        });
    }

    fn on_stop(&mut self, commands: &mut Vec<Command>) {
        self.halt_scan(commands);
        self.release_connection(commands);
        self.awaiting_descriptor_write = false;
        self.notification_enabled = None;
        self.pending_connect = None;
        self.early_disconnects.clear();
        if self.state != SessionState::Idle {
            info!("Session stopped");
            self.transition(SessionState::Idle);
        }
    }

    /// Stop the scan (if any) and discard the timer (if armed).
    fn halt_scan(&mut self, commands: &mut Vec<Command>) {
        if let ScanSlot::Running(handle) = std::mem::replace(&mut self.scan, ScanSlot::Idle) {
            commands.push(Command::StopScan(handle));
        }
        self.cancel_timer(commands);
    }

    fn cancel_timer(&mut self, commands: &mut Vec<Command>) {
        if self.timer_armed {
            self.timer_armed = false;
            commands.push(Command::CancelScanTimeout);
        }
    }

    fn release_connection(&mut self, commands: &mut Vec<Command>) {
        if let Some(handle) = self.connection.take() {
            commands.push(Command::Disconnect(handle));
        }
    }

    fn fail_connected(&mut self, reason: FailureReason, commands: &mut Vec<Command>) {
        warn!("Reader unusable: {}", reason);
        self.release_connection(commands);
        self.transition(SessionState::Failed { reason });
    }

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection
            .as_ref()
            .map(|handle| handle.id() == connection)
            .unwrap_or(false)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session state: {} -> {}", self.state.name(), next.name());
            self.state = next;
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
