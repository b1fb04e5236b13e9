//! Session configuration.

use std::time::Duration;

use crate::ble::uuids::{ServiceFingerprint, DEVICE_NAME_SUBSTRING, SCAN_TIMEOUT, SIGHTING_CAP};

/// Configuration for a [`BleUidSession`](crate::BleUidSession).
///
/// The defaults target the ESP32 RFID reader firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Identifiers of the reader.
    pub fingerprint: ServiceFingerprint,
    /// Name fragment that also identifies the reader (case-insensitive).
    pub name_substring: String,
    /// How long to scan before giving up.
    pub scan_timeout: Duration,
    /// Maximum number of sightings kept per scan.
    pub sighting_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fingerprint: ServiceFingerprint::RFID_READER,
            name_substring: DEVICE_NAME_SUBSTRING.to_string(),
            scan_timeout: SCAN_TIMEOUT,
            sighting_cap: SIGHTING_CAP,
        }
    }
}

impl SessionConfig {
    /// Use a different fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: ServiceFingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Use a different name fragment.
    pub fn with_name_substring(mut self, fragment: impl Into<String>) -> Self {
        self.name_substring = fragment.into();
        self
    }

    /// Use a different scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Use a different sighting cap.
    pub fn with_sighting_cap(mut self, cap: usize) -> Self {
        self.sighting_cap = cap;
        self
    }
}
