//! Connection supervisor, one per paired heart-rate sensor
//!
//! Owns the sensor's notification link, decodes frames as they arrive and
//! forwards them to the dashboard as [`SupervisorEvent`]s. When the link
//! drops unexpectedly the supervisor schedules a single reconnection attempt
//! using a capped exponential backoff, so a flapping sensor cannot cause an
//! endless retry storm.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect()/retry--> Connecting --ok--> Subscribed
//!      ^                                |                  |
//!      +------------failure-------------+    link loss     |
//!      +---------------------------------------------------+
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ble::gatt::{decode_heart_rate, HeartRateFrame};
use crate::ble::transport::{DeviceId, DiscoveredSensor, SensorCentral, SensorLink};
use crate::ble::{BleError, ConnectionError};
use crate::config::duration_ms;

/// Link state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Notifications are flowing. Frames are only delivered in this state.
    Subscribed,
}

/// Events emitted by a supervisor to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Connected {
        device_id: DeviceId,
        battery_level: Option<u8>,
    },
    Frame {
        device_id: DeviceId,
        frame: HeartRateFrame,
        received_at: DateTime<Utc>,
    },
    /// The link dropped without the operator asking for it.
    DeviceDisconnected { device_id: DeviceId },
    ReconnectScheduled {
        device_id: DeviceId,
        attempt: u32,
        delay: Duration,
    },
    /// The scheduled retry ran and failed; no further automatic retry.
    ReconnectFailed {
        device_id: DeviceId,
        error: ConnectionError,
    },
    /// Too many consecutive short-lived links; automatic retries stop.
    ReconnectAbandoned { device_id: DeviceId, attempts: u32 },
}

impl SupervisorEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            SupervisorEvent::Connected { device_id, .. }
            | SupervisorEvent::Frame { device_id, .. }
            | SupervisorEvent::DeviceDisconnected { device_id }
            | SupervisorEvent::ReconnectScheduled { device_id, .. }
            | SupervisorEvent::ReconnectFailed { device_id, .. }
            | SupervisorEvent::ReconnectAbandoned { device_id, .. } => device_id,
        }
    }
}

/// Backoff for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry after a loss.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Consecutive automatic retries allowed before giving up.
    pub max_attempts: u32,
    /// A link that stayed up this long resets the retry counter.
    #[serde(with = "duration_ms")]
    pub stable_after: Duration,
    /// Upper bound on one transport connect or battery read.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            stable_after: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempts + 1`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

struct SupervisorInner {
    state: LinkState,
    link: Option<Arc<dyn SensorLink>>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    /// Automatic retries since the last stable link or operator connect.
    attempts: u32,
    subscribed_at: Option<Instant>,
    battery_level: Option<u8>,
    /// Bumped on every connect attempt and every disconnect. An attempt or
    /// reader from an older epoch may not change the state.
    epoch: u64,
}

impl SupervisorInner {
    fn begin_attempt(&mut self) -> u64 {
        self.epoch += 1;
        self.state = LinkState::Connecting;
        self.epoch
    }
}

/// Supervises the link to one physical sensor.
pub struct ConnectionSupervisor {
    sensor: DiscoveredSensor,
    central: Arc<dyn SensorCentral>,
    policy: ReconnectPolicy,
    events: mpsc::Sender<SupervisorEvent>,
    inner: Mutex<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(
        sensor: DiscoveredSensor,
        central: Arc<dyn SensorCentral>,
        policy: ReconnectPolicy,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sensor,
            central,
            policy,
            events,
            inner: Mutex::new(SupervisorInner {
                state: LinkState::Disconnected,
                link: None,
                reader: None,
                retry: None,
                attempts: 0,
                subscribed_at: None,
                battery_level: None,
                epoch: 0,
            }),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.sensor.id
    }

    pub fn sensor(&self) -> &DiscoveredSensor {
        &self.sensor
    }

    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    pub async fn battery_level(&self) -> Option<u8> {
        self.inner.lock().await.battery_level
    }

    /// Whether an automatic retry is waiting to fire.
    pub async fn has_pending_retry(&self) -> bool {
        self.inner
            .lock()
            .await
            .retry
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Operator-initiated connect. Resets the retry budget.
    ///
    /// Supersedes an attempt already in flight, which then fails with
    /// [`ConnectionError::Cancelled`].
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
            inner.attempts = 0;
            if inner.state == LinkState::Subscribed {
                return Ok(());
            }
            inner.begin_attempt()
        };
        let event = self.establish(epoch).await?;
        self.emit(event).await;
        Ok(())
    }

    /// Open the link and read the battery once, then start the reader task.
    ///
    /// The state lock is not held while the transport works, so `state()`
    /// and `battery_level()` answer immediately during a slow connect. The
    /// result is committed only if `epoch` is still current.
    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<SupervisorEvent, ConnectionError> {
        let limit = self.policy.connect_timeout;
        let connected = tokio::time::timeout(limit, self.central.connect(&self.sensor))
            .await
            .unwrap_or_else(|_| Err(BleError::Timeout.into()));
        let link: Arc<dyn SensorLink> = match connected {
            Ok(link) => Arc::from(link),
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    inner.state = LinkState::Disconnected;
                }
                return Err(e);
            }
        };

        let battery_level = match tokio::time::timeout(limit, link.read_battery_level()).await {
            Ok(Ok(level)) => level,
            Ok(Err(e)) => {
                log::debug!("Battery read failed for {}: {}", self.sensor.id, e);
                None
            }
            Err(_) => {
                log::debug!("Battery read timed out for {}", self.sensor.id);
                None
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch == epoch && inner.state == LinkState::Connecting {
                inner.state = LinkState::Subscribed;
                inner.subscribed_at = Some(Instant::now());
                inner.battery_level = battery_level;
                inner.link = Some(Arc::clone(&link));
                inner.reader = Some(self.spawn_reader(link, epoch));

                log::info!("Subscribed to heart-rate notifications from {}", self.sensor.id);
                return Ok(SupervisorEvent::Connected {
                    device_id: self.sensor.id.clone(),
                    battery_level,
                });
            }
        }

        log::debug!("Discarding superseded link to {}", self.sensor.id);
        if let Err(e) = link.disconnect().await {
            log::debug!("Disconnect from {} reported: {}", self.sensor.id, e);
        }
        Err(ConnectionError::Cancelled)
    }

    fn spawn_reader(self: &Arc<Self>, link: Arc<dyn SensorLink>, epoch: u64) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match link.next_notification().await {
                    Ok(payload) => match decode_heart_rate(&payload) {
                        Ok(frame) => {
                            let event = SupervisorEvent::Frame {
                                device_id: supervisor.sensor.id.clone(),
                                frame,
                                received_at: Utc::now(),
                            };
                            if supervisor.events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!(
                                "Dropping malformed frame from {}: {}",
                                supervisor.sensor.id,
                                e
                            );
                        }
                    },
                    Err(e) => {
                        log::debug!("Link to {} ended: {}", supervisor.sensor.id, e);
                        supervisor.handle_link_loss(epoch, false).await;
                        break;
                    }
                }
            }
        })
    }

    /// Called by the transport when a live link drops unexpectedly.
    pub async fn on_link_loss(self: &Arc<Self>) {
        let epoch = self.inner.lock().await.epoch;
        self.handle_link_loss(epoch, true).await;
    }

    // Boxed: reachable again from the reader spawned by its own retry.
    fn handle_link_loss(self: &Arc<Self>, epoch: u64, abort_reader: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut pending = Vec::new();
            let released = {
                let mut inner = self.inner.lock().await;
                // Only the current link may report a loss, and only once.
                if inner.epoch != epoch || inner.state != LinkState::Subscribed {
                    return;
                }
                inner.state = LinkState::Disconnected;
                if let Some(reader) = inner.reader.take() {
                    if abort_reader {
                        reader.abort();
                    }
                }
                let released = inner.link.take();

                let stable = inner
                    .subscribed_at
                    .take()
                    .map(|at| at.elapsed() >= self.policy.stable_after)
                    .unwrap_or(false);
                if stable {
                    inner.attempts = 0;
                }

                log::info!("Lost link to {}", self.sensor.id);
                pending.push(SupervisorEvent::DeviceDisconnected {
                    device_id: self.sensor.id.clone(),
                });

                // At most one queued retry per device.
                if inner.retry.is_some() {
                    log::debug!("Retry already pending for {}", self.sensor.id);
                } else if inner.attempts >= self.policy.max_attempts {
                    log::warn!(
                        "Giving up on {} after {} reconnection attempts",
                        self.sensor.id,
                        inner.attempts
                    );
                    pending.push(SupervisorEvent::ReconnectAbandoned {
                        device_id: self.sensor.id.clone(),
                        attempts: inner.attempts,
                    });
                } else {
                    let delay = self.policy.delay_for(inner.attempts);
                    inner.attempts += 1;
                    log::info!(
                        "Reconnecting to {} in {:?} (attempt {})",
                        self.sensor.id,
                        delay,
                        inner.attempts
                    );
                    pending.push(SupervisorEvent::ReconnectScheduled {
                        device_id: self.sensor.id.clone(),
                        attempt: inner.attempts,
                        delay,
                    });
                    let supervisor = Arc::clone(self);
                    inner.retry = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        supervisor.retry().await;
                    }));
                }
                released
            };
            if let Some(link) = released {
                let _ = link.disconnect().await;
            }
            for event in pending {
                self.emit(event).await;
            }
        })
    }

    /// Body of the scheduled retry task.
    async fn retry(self: &Arc<Self>) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            // Drop our own handle without aborting ourselves.
            inner.retry.take();
            if inner.state != LinkState::Disconnected {
                return;
            }
            inner.begin_attempt()
        };
        let event = match self.establish(epoch).await {
            Ok(event) => event,
            Err(ConnectionError::Cancelled) => return,
            Err(error) => {
                log::warn!("Reconnection to {} failed: {}", self.sensor.id, error);
                SupervisorEvent::ReconnectFailed {
                    device_id: self.sensor.id.clone(),
                    error,
                }
            }
        };
        self.emit(event).await;
    }

    /// Operator-initiated disconnect. Cancels any pending retry and any
    /// connect still in flight.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.inner.lock().await;
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.epoch += 1;
            inner.state = LinkState::Disconnected;
            inner.subscribed_at = None;
            inner.link.take()
        };
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                log::debug!("Disconnect from {} reported: {}", self.sensor.id, e);
            }
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Supervisor events for {} have no listener", self.sensor.id);
        }
    }
}
