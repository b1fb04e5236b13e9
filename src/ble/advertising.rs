//! Advertisement data and target matching.
//!
//! An advertisement is reduced to the fields the session cares about: an
//! identifier the adapter can connect to, the advertised name, the device
//! address and the advertised service UUIDs.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Label used when an advertisement carries neither name nor address.
pub const UNKNOWN_LABEL: &str = "unknown";

/// A single advertisement as reported by the adapter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Identifier passed back to the adapter to connect.
    pub device_id: String,
    /// Advertised (or resolved) local name.
    pub name: Option<String>,
    /// Device address, when the platform exposes one.
    pub address: Option<String>,
    /// Service UUIDs listed in the advertisement.
    pub service_uuids: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When the advertisement was received.
    pub received_at: DateTime<Utc>,
}

impl Advertisement {
    /// Create an advertisement received now.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            address: None,
            service_uuids: Vec::new(),
            rssi: None,
            received_at: Utc::now(),
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the device address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Add an advertised service UUID.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Human-readable label: name, falling back to address, then "unknown".
    pub fn label(&self) -> String {
        self.name
            .as_deref()
            .or(self.address.as_deref())
            .unwrap_or(UNKNOWN_LABEL)
            .to_string()
    }

    /// Check if the advertisement lists the given service.
    pub fn advertises_service(&self, service_id: &Uuid) -> bool {
        self.service_uuids.contains(service_id)
    }

    /// Check if the name contains `fragment`, ignoring case.
    pub fn name_contains(&self, fragment: &str) -> bool {
        let name = match self.name.as_deref() {
            Some(name) => name,
            None => return false,
        };
        name.to_lowercase().contains(&fragment.to_lowercase())
    }

    /// Check if this advertisement comes from the target reader.
    ///
    /// The service check and the name check are OR'd; either is enough.
    pub fn matches(&self, service_id: &Uuid, name_fragment: &str) -> bool {
        self.advertises_service(service_id) || self.name_contains(name_fragment)
    }
}
