//! Session states and failure reasons.

use thiserror::Error;

use crate::error::Error;

/// Why an attempt ended.
///
/// The `Display` text is the status shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureReason {
    /// A scan or connect capability was refused.
    #[error("Missing permission")]
    PermissionDenied,

    /// The radio is switched off.
    #[error("Bluetooth is off")]
    AdapterDisabled,

    /// The adapter reported a scan error.
    #[error("Scan failed: {0}")]
    ScanFailed(i32),

    /// The reader does not expose the RFID service.
    #[error("Service not found")]
    ServiceNotFound,

    /// The RFID service lacks the UID characteristic.
    #[error("UID characteristic not found")]
    CharacteristicNotFound,

    /// Notifications could not be enabled.
    #[error("Subscribe failed")]
    SubscribeFailed,

    /// The peripheral disconnected.
    #[error("Disconnected")]
    ConnectionLost,

    /// No matching device was seen before the scan timed out.
    #[error("Not found")]
    Timeout,

    /// The adapter could not open the connection.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

impl From<&Error> for FailureReason {
    fn from(error: &Error) -> Self {
        match error {
            Error::PermissionDenied => Self::PermissionDenied,
            Error::BluetoothUnavailable => Self::AdapterDisabled,
            Error::ScanFailed { code } => Self::ScanFailed(*code),
            Error::ServiceNotFound { .. } => Self::ServiceNotFound,
            Error::CharacteristicNotFound { .. } | Error::DescriptorNotFound { .. } => {
                Self::CharacteristicNotFound
            }
            Error::ConnectionLost | Error::NotConnected => Self::ConnectionLost,
            Error::ConnectionFailed { reason } => Self::ConnectFailed(reason.clone()),
            other => Self::ConnectFailed(other.to_string()),
        }
    }
}

/// Lifecycle phase of a [`BleUidSession`](crate::BleUidSession).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Nothing running.
    #[default]
    Idle,
    /// Waiting for the platform to grant scan/connect capabilities.
    RequestingPermission,
    /// Scanning for the reader.
    Scanning,
    /// Connecting to a matched device.
    Connecting {
        /// Label of the matched device.
        device: String,
    },
    /// Connected, discovering services.
    DiscoveringServices,
    /// Enabling notifications on the UID characteristic.
    Subscribing,
    /// Subscribed (or attempted to) and waiting for UID values.
    AwaitingUid {
        /// Whether notifications were enabled successfully.
        subscribed: bool,
    },
    /// The attempt ended without an error; `start()` may be called again.
    Disconnected {
        /// `Timeout` after an unsuccessful scan, `ConnectionLost` otherwise.
        reason: FailureReason,
    },
    /// The attempt ended with an error.
    Failed {
        /// What went wrong.
        reason: FailureReason,
    },
}

impl SessionState {
    /// Check if `start()` may begin a new attempt from here.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Disconnected { .. } | Self::Failed { .. }
        )
    }

    /// Check if a connection is (or is being) held in this state.
    pub fn is_connected_phase(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. }
                | Self::DiscoveringServices
                | Self::Subscribing
                | Self::AwaitingUid { .. }
        )
    }

    /// Check if scanning.
    pub fn is_scanning(&self) -> bool {
        matches!(self, Self::Scanning)
    }

    /// The failure behind this state, if any.
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed { reason } => Some(reason),
            Self::AwaitingUid { subscribed: false } => Some(&FailureReason::SubscribeFailed),
            _ => None,
        }
    }

    /// Short name of the phase, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::RequestingPermission => "RequestingPermission",
            Self::Scanning => "Scanning",
            Self::Connecting { .. } => "Connecting",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::Subscribing => "Subscribing",
            Self::AwaitingUid { .. } => "AwaitingUid",
            Self::Disconnected { .. } => "Disconnected",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::RequestingPermission => write!(f, "Requesting permissions..."),
            Self::Scanning => write!(f, "Scanning..."),
            Self::Connecting { device } => write!(f, "Device found: {}. Connecting...", device),
            Self::DiscoveringServices => write!(f, "Connected. Discovering services..."),
            Self::Subscribing => write!(f, "Subscribing to UID notifications..."),
            Self::AwaitingUid { subscribed: true } => write!(f, "Subscribed. Waiting for UID..."),
            Self::AwaitingUid { subscribed: false } => {
                write!(f, "{}", FailureReason::SubscribeFailed)
            }
            Self::Disconnected { reason } | Self::Failed { reason } => write!(f, "{}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_start() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Failed {
            reason: FailureReason::ServiceNotFound
        }
        .can_start());
        assert!(SessionState::Disconnected {
            reason: FailureReason::Timeout
        }
        .can_start());
        assert!(!SessionState::Scanning.can_start());
        assert!(!SessionState::RequestingPermission.can_start());
        assert!(!SessionState::AwaitingUid { subscribed: true }.can_start());
    }

    #[test]
    fn test_connected_phase() {
        assert!(SessionState::DiscoveringServices.is_connected_phase());
        assert!(SessionState::Connecting {
            device: "x".to_string()
        }
        .is_connected_phase());
        assert!(!SessionState::Scanning.is_connected_phase());
        assert!(!SessionState::Idle.is_connected_phase());
    }

    #[test]
    fn test_status_text() {
        assert_eq!(SessionState::Idle.to_string(), "Idle");
        assert_eq!(
            SessionState::Connecting {
                device: "ESP32-RFID".to_string()
            }
            .to_string(),
            "Device found: ESP32-RFID. Connecting..."
        );
        assert_eq!(
            SessionState::Failed {
                reason: FailureReason::PermissionDenied
            }
            .to_string(),
            "Missing permission"
        );
        assert_eq!(
            SessionState::Failed {
                reason: FailureReason::ScanFailed(2)
            }
            .to_string(),
            "Scan failed: 2"
        );
        assert_eq!(
            SessionState::AwaitingUid { subscribed: false }.to_string(),
            "Subscribe failed"
        );
    }

    #[test]
    fn test_failure_from_error() {
        assert_eq!(
            FailureReason::from(&Error::PermissionDenied),
            FailureReason::PermissionDenied
        );
        assert_eq!(
            FailureReason::from(&Error::ScanFailed { code: 4 }),
            FailureReason::ScanFailed(4)
        );
        assert_eq!(
            FailureReason::from(&Error::ConnectionFailed {
                reason: "busy".to_string()
            }),
            FailureReason::ConnectFailed("busy".to_string())
        );
        assert_eq!(
            FailureReason::from(&Error::BluetoothUnavailable),
            FailureReason::AdapterDisabled
        );
    }

    #[test]
    fn test_failure_accessor() {
        assert_eq!(
            SessionState::AwaitingUid { subscribed: false }.failure(),
            Some(&FailureReason::SubscribeFailed)
        );
        assert_eq!(SessionState::AwaitingUid { subscribed: true }.failure(), None);
    }
}
