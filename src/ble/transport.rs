//! Sensor transport trait definitions and core types
//!
//! Defines the abstract interface that both the simulated transport and the
//! btleplug central conform to. A `SensorCentral` discovers and connects
//! heart-rate peripherals; each connection is a `SensorLink` delivering raw
//! Heart Rate Measurement notifications.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::gatt::HEART_RATE_SERVICE;
use super::{BleError, ConnectionError};

/// Opaque device identifier, stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceId {
    /// A real 6-byte BLE MAC address.
    Address([u8; 6]),
    /// A platform peripheral handle (CoreBluetooth/WinRT ids are not MACs).
    Platform(String),
    /// A simulated device identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Address(bytes) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
            ),
            DeviceId::Platform(id) => write!(f, "{}", id),
            DeviceId::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredSensor {
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Advertised primary services.
    pub services: Vec<Uuid>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
}

impl DiscoveredSensor {
    /// Whether this peripheral advertises the heart-rate service.
    pub fn has_heart_rate(&self) -> bool {
        self.services.contains(&HEART_RATE_SERVICE)
    }
}

/// A live notification subscription to one heart-rate sensor.
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Wait for the next Heart Rate Measurement notification payload.
    ///
    /// Returns `BleError::Disconnected` once the link is lost.
    async fn next_notification(&self) -> Result<Vec<u8>, BleError>;

    /// Read the battery level characteristic, if the sensor has one.
    async fn read_battery_level(&self) -> Result<Option<u8>, BleError>;

    /// Release the subscription and drop the link.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// The sensor at the other end.
    fn device_id(&self) -> &DeviceId;

    /// Check whether the link is still active.
    fn is_connected(&self) -> bool;
}

/// BLE central role for heart-rate sensors: discovery and connection.
#[async_trait]
pub trait SensorCentral: Send + Sync {
    /// Start scanning for heart-rate peripherals.
    async fn start_scan(&self) -> Result<(), ConnectionError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), ConnectionError>;

    /// Subscribe to discovered peripherals.
    fn discoveries(&self) -> broadcast::Receiver<DiscoveredSensor>;

    /// Connect to a discovered peripheral and subscribe to heart-rate
    /// notifications.
    async fn connect(&self, sensor: &DiscoveredSensor) -> Result<Box<dyn SensorLink>, ConnectionError>;
}
