//! BLE transport layer for heart-rate sensors
//!
//! Provides the sensor transport traits, the Heart Rate Measurement frame
//! decoder, a simulated transport for testing, and (behind the
//! `ble-central` feature) a btleplug-backed central.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Link-level failures on an established sensor connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}

/// Failures while setting up a sensor connection.
///
/// Each variant maps to a distinct, actionable message for the operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("No device was selected")]
    NoDeviceSelected,

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Device {0} does not expose the heart-rate service")]
    CapabilityUnsupported(String),

    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A newer connect or an operator disconnect replaced this attempt.
    #[error("Connection attempt was cancelled")]
    Cancelled,
}

impl From<BleError> for ConnectionError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::CharacteristicNotFound(what) => ConnectionError::CapabilityUnsupported(what),
            other => ConnectionError::TransportUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_characteristic_maps_to_capability_error() {
        let err: ConnectionError =
            BleError::CharacteristicNotFound("heart_rate_measurement".into()).into();
        assert_eq!(
            err,
            ConnectionError::CapabilityUnsupported("heart_rate_measurement".into())
        );

        let err: ConnectionError = BleError::Timeout.into();
        assert!(matches!(err, ConnectionError::TransportUnavailable(_)));
    }
}
