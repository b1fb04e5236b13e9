// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # rfid-uid-ble
//!
//! A Bluetooth Low Energy session that finds an ESP32-based RFID reader,
//! subscribes to its UID characteristic and reports the UID of each tag the
//! reader sees.
//!
//! ## Features
//!
//! - **Discovery**: Unfiltered scan, matching the reader by advertised service
//!   or by name
//! - **Sightings**: A short, de-duplicated list of nearby devices for status
//!   display
//! - **Notifications**: Subscribes to the UID characteristic and decodes each
//!   value as text
//! - **Lifecycle**: `start`/`stop` in any state, with scans and connections
//!   released exactly once
//! - **Testable**: The session is driven through the [`BleAdapter`] trait; the
//!   state machine is pure and can be stepped directly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rfid_uid_ble::{BleUidSession, PlatformAdapter, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = Arc::new(PlatformAdapter::new().await?);
//!     let session = BleUidSession::new(adapter)?;
//!
//!     let _status = session.on_status_changed(|status| println!("{}", status));
//!     let _uid = session.on_uid_changed(|uid| println!("UID: {}", uid));
//!
//!     session.start()?;
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod error;
pub mod session;
pub mod uid_session;

// Re-exports for convenience
pub use error::{Error, Result};
pub use uid_session::{BleUidSession, CallbackHandle, SessionUpdate};

// Re-export commonly used types from submodules
pub use ble::{
    AdapterEvent, AdapterEventSink, Advertisement, BleAdapter, Capability, ConnectionHandle,
    ConnectionId, PermissionOutcome, PlatformAdapter, ScanHandle, ServiceFingerprint, ServiceMap,
};
pub use session::{
    DeviceSighting, FailureReason, SessionConfig, SessionSnapshot, SessionState, UidValue,
    NO_UID_TEXT,
};
