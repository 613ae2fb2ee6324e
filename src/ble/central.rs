//! btleplug-backed heart-rate central
//!
//! Real BLE on Mac/Linux/Windows. Enabled with `--features ble-central`.
//! Discovery events are forwarded on a broadcast channel; each connected
//! sensor gets a `BtleSensorLink` wrapping the peripheral's notification
//! stream. Adapter-level disconnect events wake the matching link so the
//! supervisor sees the loss even when the platform never closes the stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, Mutex, Notify};

use super::gatt::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use super::transport::{DeviceId, DiscoveredSensor, SensorCentral, SensorLink};
use super::{BleError, ConnectionError};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn connection_error(err: btleplug::Error) -> ConnectionError {
    match err {
        btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied,
        btleplug::Error::NoSuchCharacteristic | btleplug::Error::UnexpectedCharacteristic => {
            ConnectionError::CapabilityUnsupported(err.to_string())
        }
        other => ConnectionError::TransportUnavailable(other.to_string()),
    }
}

fn link_error(err: btleplug::Error) -> BleError {
    match err {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => BleError::Disconnected,
        btleplug::Error::TimedOut(_) => BleError::Timeout,
        other => BleError::GattError(other.to_string()),
    }
}

fn device_id_for(peripheral: &Peripheral) -> DeviceId {
    DeviceId::Platform(format!("{:?}", peripheral.id()))
}

/// Find the measurement characteristic and subscribe to it. Returns the
/// battery characteristic, if any, and the notification stream.
async fn subscribe_heart_rate(
    peripheral: &Peripheral,
    sensor: &DiscoveredSensor,
) -> Result<(Option<Characteristic>, NotificationStream), ConnectionError> {
    peripheral.discover_services().await.map_err(connection_error)?;

    let characteristics = peripheral.characteristics();
    let measurement = characteristics
        .iter()
        .find(|c| c.uuid == HEART_RATE_MEASUREMENT)
        .cloned()
        .ok_or_else(|| ConnectionError::CapabilityUnsupported(sensor.id.to_string()))?;
    let battery = characteristics.iter().find(|c| c.uuid == BATTERY_LEVEL).cloned();

    peripheral.subscribe(&measurement).await.map_err(connection_error)?;
    let notifications = peripheral.notifications().await.map_err(connection_error)?;
    Ok((battery, notifications))
}

/// Liveness shared between a link and the adapter event task.
struct LinkLiveness {
    connected: AtomicBool,
    lost: Notify,
}

impl LinkLiveness {
    fn mark_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.lost.notify_waiters();
    }
}

/// Heart-rate central on the first available host adapter.
pub struct BtleCentral {
    adapter: Adapter,
    adv_tx: broadcast::Sender<DiscoveredSensor>,
    /// Peripherals seen during discovery, keyed by device id.
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    links: Arc<Mutex<HashMap<DeviceId, Arc<LinkLiveness>>>>,
    events_started: AtomicBool,
}

impl BtleCentral {
    /// Open the first Bluetooth adapter on this host.
    pub async fn new() -> Result<Arc<Self>, ConnectionError> {
        let manager = Manager::new().await.map_err(connection_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(connection_error)?
            .into_iter()
            .next()
            .ok_or_else(|| ConnectionError::TransportUnavailable("no Bluetooth adapter".into()))?;
        let (adv_tx, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            adapter,
            adv_tx,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            events_started: AtomicBool::new(false),
        }))
    }

    /// Forward adapter events: discoveries to subscribers, disconnects to links.
    async fn start_event_task(&self) -> Result<(), ConnectionError> {
        if self.events_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut events = self.adapter.events().await.map_err(connection_error)?;
        let adapter = self.adapter.clone();
        let adv_tx = self.adv_tx.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let links = Arc::clone(&self.links);

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = match adapter.peripheral(&id).await {
                            Ok(p) => p,
                            Err(e) => {
                                log::debug!("Discovered peripheral vanished: {}", e);
                                continue;
                            }
                        };
                        let props = match peripheral.properties().await {
                            Ok(Some(props)) => props,
                            _ => continue,
                        };
                        if !props.services.contains(&HEART_RATE_SERVICE) {
                            continue;
                        }
                        let device_id = device_id_for(&peripheral);
                        let sensor = DiscoveredSensor {
                            id: device_id.clone(),
                            name: props.local_name,
                            services: props.services,
                            rssi: props.rssi,
                        };
                        peripherals.lock().await.insert(device_id, peripheral);
                        let _ = adv_tx.send(sensor);
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let device_id = DeviceId::Platform(format!("{:?}", id));
                        if let Some(liveness) = links.lock().await.remove(&device_id) {
                            liveness.mark_lost();
                        }
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }
}

/// Notification subscription on a real peripheral.
pub struct BtleSensorLink {
    device_id: DeviceId,
    peripheral: Peripheral,
    notifications: Mutex<NotificationStream>,
    battery: Option<Characteristic>,
    liveness: Arc<LinkLiveness>,
}

#[async_trait]
impl SensorLink for BtleSensorLink {
    async fn next_notification(&self) -> Result<Vec<u8>, BleError> {
        let mut stream = self.notifications.lock().await;
        loop {
            if !self.is_connected() {
                return Err(BleError::Disconnected);
            }
            tokio::select! {
                next = stream.next() => match next {
                    Some(n) if n.uuid == HEART_RATE_MEASUREMENT => return Ok(n.value),
                    Some(_) => continue,
                    None => {
                        self.liveness.mark_lost();
                        return Err(BleError::Disconnected);
                    }
                },
                _ = self.liveness.lost.notified() => return Err(BleError::Disconnected),
            }
        }
    }

    async fn read_battery_level(&self) -> Result<Option<u8>, BleError> {
        match &self.battery {
            Some(characteristic) => {
                let value = self.peripheral.read(characteristic).await.map_err(link_error)?;
                Ok(value.first().copied())
            }
            None => Ok(None),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.liveness.mark_lost();
        self.peripheral.disconnect().await.map_err(link_error)
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn is_connected(&self) -> bool {
        self.liveness.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorCentral for BtleCentral {
    async fn start_scan(&self) -> Result<(), ConnectionError> {
        self.start_event_task().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![HEART_RATE_SERVICE],
            })
            .await
            .map_err(connection_error)
    }

    async fn stop_scan(&self) -> Result<(), ConnectionError> {
        self.adapter.stop_scan().await.map_err(connection_error)
    }

    fn discoveries(&self) -> broadcast::Receiver<DiscoveredSensor> {
        self.adv_tx.subscribe()
    }

    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
    ) -> Result<Box<dyn SensorLink>, ConnectionError> {
        self.start_event_task().await?;
        let peripheral = {
            let peripherals = self.peripherals.lock().await;
            peripherals.get(&sensor.id).cloned()
        }
        .ok_or_else(|| {
            ConnectionError::TransportUnavailable(format!("{} was not discovered", sensor.id))
        })?;

        peripheral.connect().await.map_err(connection_error)?;
        let (battery, notifications) = match subscribe_heart_rate(&peripheral, sensor).await {
            Ok(parts) => parts,
            Err(e) => {
                // Connected but unusable; release it before reporting.
                if let Err(err) = peripheral.disconnect().await {
                    log::debug!("Disconnect from {} after failed setup: {}", sensor.id, err);
                }
                return Err(e);
            }
        };

        let liveness = Arc::new(LinkLiveness {
            connected: AtomicBool::new(true),
            lost: Notify::new(),
        });
        self.links
            .lock()
            .await
            .insert(sensor.id.clone(), Arc::clone(&liveness));

        Ok(Box::new(BtleSensorLink {
            device_id: sensor.id.clone(),
            peripheral,
            notifications: Mutex::new(notifications),
            battery,
            liveness,
        }))
    }
}
