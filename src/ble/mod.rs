//! BLE communication module.
//!
//! This module defines the adapter capability the session depends on, the
//! advertisement model used for matching, the reader's UUIDs, and a desktop
//! adapter backed by btleplug.

pub mod adapter;
pub mod advertising;
pub mod platform;
pub mod uuids;

pub use adapter::{
    AdapterEvent, AdapterEventSink, BleAdapter, Capability, CharacteristicInfo, ConnectionHandle,
    ConnectionId, PermissionOutcome, ScanHandle, ServiceMap, ALL_CAPABILITIES,
};
pub use advertising::Advertisement;
pub use platform::PlatformAdapter;
pub use uuids::*;
