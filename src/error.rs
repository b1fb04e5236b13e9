//! Error types for the rfid-uid-ble crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Adapter implementations return these; the session maps them into a
/// [`FailureReason`](crate::session::FailureReason) before they reach the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The platform refused a scan or connect capability.
    #[error("Missing permission")]
    PermissionDenied,

    /// The requested peripheral is unknown to the adapter.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but none is open for this id.
    #[error("Not connected")]
    NotConnected,

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the peripheral was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// The adapter reported a scan error.
    #[error("Scan failed: {code}")]
    ScanFailed {
        /// Platform-specific error code.
        code: i32,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Descriptor not found on the characteristic.
    #[error("Descriptor not found: {uuid}")]
    DescriptorNotFound {
        /// The UUID of the descriptor that was not found.
        uuid: String,
    },

    /// The session event loop is no longer running.
    #[error("Session closed")]
    SessionClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
