//! In-process heart-rate sensor simulator
//!
//! Provides a simulated BLE "air" where heart-rate sensors can advertise,
//! accept a central connection, stream measurements, and drop their link
//! entirely in-process. Used for integration testing and the demo binary
//! without requiring real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use super::gatt::{encode_heart_rate, BATTERY_SERVICE, HEART_RATE_SERVICE};
use super::transport::{DeviceId, DiscoveredSensor, SensorCentral, SensorLink};
use super::{BleError, ConnectionError};

/// Per-sensor state held by the network.
struct SimSensorSlot {
    descriptor: DiscoveredSensor,
    battery_level: Option<u8>,
    /// Whether the sensor currently accepts connections.
    reachable: bool,
    /// Sender half of the active link, if any.
    link: Option<(mpsc::Sender<Vec<u8>>, Arc<AtomicBool>)>,
}

/// The simulated "air" through which all simulated sensors communicate.
pub struct SimSensorNetwork {
    /// Broadcast channel for discoveries.
    adv_tx: broadcast::Sender<DiscoveredSensor>,
    sensors: Arc<Mutex<HashMap<DeviceId, SimSensorSlot>>>,
    scanning: AtomicBool,
    permission_denied: AtomicBool,
    powered: AtomicBool,
}

impl SimSensorNetwork {
    /// Create a new simulated network with the adapter powered on.
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            adv_tx,
            sensors: Arc::new(Mutex::new(HashMap::new())),
            scanning: AtomicBool::new(false),
            permission_denied: AtomicBool::new(false),
            powered: AtomicBool::new(true),
        })
    }

    /// Add a heart-rate sensor with a battery service.
    pub async fn add_sensor(self: &Arc<Self>, name: &str) -> SimSensor {
        self.add_peripheral(name, vec![HEART_RATE_SERVICE, BATTERY_SERVICE], Some(100))
            .await
    }

    /// Add a peripheral with an arbitrary service list.
    pub async fn add_peripheral(
        self: &Arc<Self>,
        name: &str,
        services: Vec<Uuid>,
        battery_level: Option<u8>,
    ) -> SimSensor {
        let id = DeviceId::Simulated(Uuid::new_v4());
        let descriptor = DiscoveredSensor {
            id: id.clone(),
            name: Some(name.to_string()),
            services,
            rssi: Some(-55),
        };
        {
            let mut sensors = self.sensors.lock().await;
            sensors.insert(
                id.clone(),
                SimSensorSlot {
                    descriptor: descriptor.clone(),
                    battery_level,
                    reachable: true,
                    link: None,
                },
            );
        }
        if self.scanning.load(Ordering::SeqCst) {
            let _ = self.adv_tx.send(descriptor);
        }
        SimSensor {
            id,
            network: Arc::clone(self),
        }
    }

    /// Simulate the operator refusing the Bluetooth permission prompt.
    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Simulate the host adapter being switched off.
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    fn check_adapter(&self) -> Result<(), ConnectionError> {
        if !self.powered.load(Ordering::SeqCst) {
            return Err(ConnectionError::TransportUnavailable(
                "adapter powered off".to_string(),
            ));
        }
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(ConnectionError::PermissionDenied);
        }
        Ok(())
    }
}

/// Test handle for one simulated sensor.
pub struct SimSensor {
    id: DeviceId,
    network: Arc<SimSensorNetwork>,
}

impl SimSensor {
    /// Get this sensor's device id.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// The discovery record a central would see for this sensor.
    pub async fn descriptor(&self) -> DiscoveredSensor {
        let sensors = self.network.sensors.lock().await;
        match sensors.get(&self.id) {
            Some(slot) => slot.descriptor.clone(),
            None => DiscoveredSensor {
                id: self.id.clone(),
                name: None,
                services: Vec::new(),
                rssi: None,
            },
        }
    }

    /// Push a raw notification payload to the connected central.
    pub async fn notify(&self, payload: Vec<u8>) -> Result<(), BleError> {
        let tx = {
            let sensors = self.network.sensors.lock().await;
            sensors
                .get(&self.id)
                .and_then(|slot| slot.link.as_ref())
                .map(|(tx, _)| tx.clone())
        };
        match tx {
            Some(tx) => tx.send(payload).await.map_err(|_| BleError::Disconnected),
            None => Err(BleError::Disconnected),
        }
    }

    /// Push a heart-rate measurement using the narrowest field width.
    pub async fn send_heart_rate(&self, bpm: u16) -> Result<(), BleError> {
        self.notify(encode_heart_rate(bpm)).await
    }

    /// Drop the active link as if the sensor went out of range.
    pub async fn drop_link(&self) {
        let mut sensors = self.network.sensors.lock().await;
        if let Some(slot) = sensors.get_mut(&self.id) {
            if let Some((_, connected)) = slot.link.take() {
                connected.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Control whether the sensor accepts new connections.
    pub async fn set_reachable(&self, reachable: bool) {
        let mut sensors = self.network.sensors.lock().await;
        if let Some(slot) = sensors.get_mut(&self.id) {
            slot.reachable = reachable;
        }
    }

    /// Whether a central currently holds a link to this sensor.
    pub async fn is_linked(&self) -> bool {
        let sensors = self.network.sensors.lock().await;
        sensors
            .get(&self.id)
            .and_then(|slot| slot.link.as_ref())
            .map(|(_, connected)| connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// A simulated notification subscription backed by a tokio mpsc channel.
pub struct SimSensorLink {
    device_id: DeviceId,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    battery_level: Option<u8>,
    sensors: Arc<Mutex<HashMap<DeviceId, SimSensorSlot>>>,
}

#[async_trait]
impl SensorLink for SimSensorLink {
    async fn next_notification(&self) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(data) if self.is_connected() => Ok(data),
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                Err(BleError::Disconnected)
            }
        }
    }

    async fn read_battery_level(&self) -> Result<Option<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        Ok(self.battery_level)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut sensors = self.sensors.lock().await;
        if let Some(slot) = sensors.get_mut(&self.device_id) {
            // Only release the slot if it still holds our link.
            let ours = slot
                .link
                .as_ref()
                .map(|(_, flag)| Arc::ptr_eq(flag, &self.connected))
                .unwrap_or(false);
            if ours {
                slot.link = None;
            }
        }
        Ok(())
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorCentral for SimSensorNetwork {
    async fn start_scan(&self) -> Result<(), ConnectionError> {
        self.check_adapter()?;
        self.scanning.store(true, Ordering::SeqCst);
        let sensors = self.sensors.lock().await;
        for slot in sensors.values() {
            let _ = self.adv_tx.send(slot.descriptor.clone());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), ConnectionError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn discoveries(&self) -> broadcast::Receiver<DiscoveredSensor> {
        self.adv_tx.subscribe()
    }

    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
    ) -> Result<Box<dyn SensorLink>, ConnectionError> {
        self.check_adapter()?;

        let mut sensors = self.sensors.lock().await;
        let slot = sensors.get_mut(&sensor.id).ok_or_else(|| {
            ConnectionError::TransportUnavailable(format!("No peripheral at {}", sensor.id))
        })?;

        if !slot.descriptor.has_heart_rate() {
            return Err(ConnectionError::CapabilityUnsupported(sensor.id.to_string()));
        }
        if !slot.reachable {
            return Err(ConnectionError::TransportUnavailable(format!(
                "{} is out of range",
                sensor.id
            )));
        }

        // A new connection supersedes any stale one.
        if let Some((_, old)) = slot.link.take() {
            old.store(false, Ordering::SeqCst);
        }

        let (tx, rx) = mpsc::channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        slot.link = Some((tx, Arc::clone(&connected)));

        Ok(Box::new(SimSensorLink {
            device_id: sensor.id.clone(),
            rx: Mutex::new(rx),
            connected,
            battery_level: slot.battery_level,
            sensors: Arc::clone(&self.sensors),
        }))
    }
}
