//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! The RFID reader exposes its tag UID on a Nordic UART style service.
//! These values must match the reader firmware exactly.

use std::time::Duration;
use uuid::Uuid;

/// RFID reader service UUID (advertised by the reader).
pub const RFID_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);

/// UID characteristic UUID (Read, Notify).
pub const UID_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);

/// Client Characteristic Configuration Descriptor UUID.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Advertised name fragment of the reader, matched case-insensitively.
pub const DEVICE_NAME_SUBSTRING: &str = "ESP32-RFID";

/// How long a scan may run without a match.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of distinct devices remembered per scan.
pub const SIGHTING_CAP: usize = 10;

/// The identifiers used to recognise the reader and its UID characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceFingerprint {
    /// Service that must be advertised or discovered.
    pub service_id: Uuid,
    /// Characteristic carrying the UID.
    pub uid_characteristic_id: Uuid,
    /// Descriptor that enables notifications on the UID characteristic.
    pub notification_descriptor_id: Uuid,
}

impl ServiceFingerprint {
    /// The fingerprint of the ESP32 RFID reader firmware.
    pub const RFID_READER: Self = Self {
        service_id: RFID_SERVICE_UUID,
        uid_characteristic_id: UID_CHARACTERISTIC_UUID,
        notification_descriptor_id: CCCD_UUID,
    };
}

impl Default for ServiceFingerprint {
    fn default() -> Self {
        Self::RFID_READER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            RFID_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            UID_CHARACTERISTIC_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_uuid_parses_uppercase() {
        let parsed = Uuid::parse_str("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap();
        assert_eq!(parsed, RFID_SERVICE_UUID);
    }

    #[test]
    fn test_default_fingerprint() {
        let fingerprint = ServiceFingerprint::default();
        assert_eq!(fingerprint.service_id, RFID_SERVICE_UUID);
        assert_eq!(fingerprint.uid_characteristic_id, UID_CHARACTERISTIC_UUID);
        assert_eq!(fingerprint.notification_descriptor_id, CCCD_UUID);
    }
}
