//! Dashboard controller
//!
//! Wires supervisors, the participant registry, the session aggregator and
//! the grid layout engine together. Supervisor events arrive on one mpsc
//! channel and are handled by a single event loop; render frames go out on
//! a broadcast channel every render tick and whenever the layout changes.
//!
//! Timers (render tick, session tick, resize debounce) hold only a `Weak`
//! reference to the dashboard and are cancelled by [`Dashboard::stop`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::ble::transport::{DeviceId, DiscoveredSensor, SensorCentral};
use crate::ble::ConnectionError;
use crate::config::DashboardConfig;
use crate::layout::{compute_grid, GridLayout, Viewport};
use crate::membership::{resolve_with_timeout, MembershipResolver};
use crate::storage::{DeviceAssociations, PersistenceError, SessionRef, SessionStore, StoredSample};

use super::registry::{
    GlobalStats, ParticipantCard, ParticipantId, ParticipantRegistry, RegistryError,
    SampleOutcome,
};
use super::session::{SessionAggregator, SessionError, SessionSnapshot, SessionState, SessionSummary};
use super::supervisor::{ConnectionSupervisor, LinkState, SupervisorEvent};
use super::ticker::{Debouncer, Ticker};

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("No active session")]
    NoActiveSession,

    #[error("A session is already active")]
    SessionAlreadyActive,
}

/// Operator-facing status of one paired device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub state: LinkState,
    pub participant: Option<ParticipantId>,
    pub battery_level: Option<u8>,
    /// Last connection problem, cleared on the next successful connect.
    pub last_error: Option<String>,
}

/// Everything the render surface needs for one repaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub generated_at: DateTime<Utc>,
    pub viewport: Viewport,
    pub layout: GridLayout,
    pub cards: Vec<ParticipantCard>,
    pub stats: GlobalStats,
    pub session: Option<SessionSnapshot>,
    pub devices: Vec<DeviceStatus>,
}

struct DeviceEntry {
    supervisor: Arc<ConnectionSupervisor>,
    last_error: Option<String>,
}

/// Where the stored record of the active session stands.
enum RecordState {
    /// The store has not answered yet. Samples wait here in arrival order.
    Creating(Vec<StoredSample>),
    Saved(SessionRef),
    Unsaved,
}

struct ActiveSession {
    aggregator: SessionAggregator,
    record: RecordState,
    ticker: Option<Ticker>,
    /// Set on stop, so a record created late can still be closed.
    summary: Option<SessionSummary>,
}

pub struct Dashboard {
    config: DashboardConfig,
    central: Arc<dyn SensorCentral>,
    membership: Arc<dyn MembershipResolver>,
    store: Arc<dyn SessionStore>,
    registry: RwLock<ParticipantRegistry>,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    session: Mutex<Option<ActiveSession>>,
    associations: Mutex<Option<DeviceAssociations>>,
    viewport: RwLock<Viewport>,
    layout: RwLock<GridLayout>,
    frames_tx: broadcast::Sender<RenderFrame>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SupervisorEvent>>>,
    render_ticker: Mutex<Option<Ticker>>,
    resize: Mutex<Debouncer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Dashboard {
    pub fn new(
        config: DashboardConfig,
        central: Arc<dyn SensorCentral>,
        membership: Arc<dyn MembershipResolver>,
        store: Arc<dyn SessionStore>,
        associations: Option<DeviceAssociations>,
    ) -> Arc<Self> {
        let registry = ParticipantRegistry::new(config.participants.clone(), config.zones.clone());
        let (frames_tx, _) = broadcast::channel(16);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);
        let resize = Debouncer::new(config.timing.resize_debounce);

        Arc::new(Self {
            config,
            central,
            membership,
            store,
            registry: RwLock::new(registry),
            devices: RwLock::new(HashMap::new()),
            session: Mutex::new(None),
            associations: Mutex::new(associations),
            viewport: RwLock::new(Viewport::default()),
            layout: RwLock::new(GridLayout::Empty),
            frames_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            render_ticker: Mutex::new(None),
            resize: Mutex::new(resize),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Receive render frames.
    pub fn subscribe(&self) -> broadcast::Receiver<RenderFrame> {
        self.frames_tx.subscribe()
    }

    /// Start the event loop and the render tick. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let rx = match self.events_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        let dashboard = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => dashboard.handle_event(event).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });

        let weak = Arc::downgrade(self);
        let ticker = Ticker::spawn(self.config.timing.render_interval, move || {
            let weak = Weak::clone(&weak);
            async move {
                match weak.upgrade() {
                    Some(dashboard) => {
                        dashboard.publish_frame().await;
                        true
                    }
                    None => false,
                }
            }
        });
        *self.render_ticker.lock().await = Some(ticker);

        self.relayout().await;
    }

    /// Stop every timer and release every device link.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(ticker) = self.render_ticker.lock().await.take() {
            ticker.cancel();
        }
        self.resize.lock().await.cancel();
        if let Some(active) = self.session.lock().await.as_mut() {
            if let Some(ticker) = active.ticker.take() {
                ticker.cancel();
            }
        }
        let supervisors: Vec<Arc<ConnectionSupervisor>> = self
            .devices
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.supervisor))
            .collect();
        for supervisor in supervisors {
            supervisor.disconnect().await;
        }
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Connect a discovered sensor and attach it to a participant.
    ///
    /// With no participant given, the stored pairing for the device is
    /// used, and failing that a new participant is created.
    pub async fn connect_device(
        self: &Arc<Self>,
        sensor: Option<DiscoveredSensor>,
        participant: Option<ParticipantId>,
    ) -> Result<ParticipantId, DashboardError> {
        let sensor = sensor.ok_or(ConnectionError::NoDeviceSelected)?;
        let device_id = sensor.id.clone();

        let remembered = match participant {
            Some(_) => None,
            None => self
                .associations
                .lock()
                .await
                .as_ref()
                .and_then(|table| table.participant_for(&device_id)),
        };
        let existing_owner = self.registry.read().await.participant_for_device(&device_id);
        let participant = participant
            .or(existing_owner)
            .or(remembered)
            .unwrap_or_else(uuid::Uuid::new_v4);

        let created = {
            let mut registry = self.registry.write().await;
            let created = registry.ensure_participant(participant);
            if let Err(e) = registry.assign_device(participant, device_id.clone()) {
                if created {
                    registry.remove_participant(&participant);
                }
                return Err(e.into());
            }
            created
        };

        let supervisor = {
            let mut devices = self.devices.write().await;
            let entry = devices.entry(device_id.clone()).or_insert_with(|| DeviceEntry {
                supervisor: ConnectionSupervisor::new(
                    sensor.clone(),
                    Arc::clone(&self.central),
                    self.config.reconnect.clone(),
                    self.events_tx.clone(),
                ),
                last_error: None,
            });
            Arc::clone(&entry.supervisor)
        };

        if let Err(e) = supervisor.connect().await {
            if e == ConnectionError::Cancelled {
                // A later connect or disconnect owns the outcome.
                log::debug!("Connect to {} superseded", device_id);
                return Err(e.into());
            }
            log::warn!("Could not connect to {}: {}", device_id, e);
            {
                let mut registry = self.registry.write().await;
                registry.unassign_device(&device_id);
                let untouched = registry
                    .get(&participant)
                    .map(|p| p.last_update.is_none())
                    .unwrap_or(false);
                if created && untouched {
                    registry.remove_participant(&participant);
                }
            }
            if let Some(entry) = self.devices.write().await.get_mut(&device_id) {
                entry.last_error = Some(e.to_string());
            }
            return Err(e.into());
        }

        if let Some(table) = self.associations.lock().await.as_mut() {
            table.associate(device_id, participant);
        }
        if created {
            self.relayout().await;
        }
        self.spawn_resolution(participant).await;
        Ok(participant)
    }

    /// Operator disconnect. The participant stays on screen, marked stale.
    pub async fn disconnect_device(&self, device_id: &DeviceId) -> Result<(), DashboardError> {
        let entry = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| DashboardError::UnknownDevice(device_id.clone()))?;
        entry.supervisor.disconnect().await;

        let mut registry = self.registry.write().await;
        registry.mark_link_lost(device_id);
        registry.unassign_device(device_id);
        Ok(())
    }

    /// Move a device to another participant. The device must be free.
    pub async fn assign_device(
        &self,
        device_id: DeviceId,
        participant: ParticipantId,
    ) -> Result<(), DashboardError> {
        if !self.devices.read().await.contains_key(&device_id) {
            return Err(DashboardError::UnknownDevice(device_id));
        }
        self.registry
            .write()
            .await
            .assign_device(participant, device_id.clone())?;
        if let Some(table) = self.associations.lock().await.as_mut() {
            table.associate(device_id, participant);
        }
        Ok(())
    }

    /// Detach a device from its participant without closing the link.
    pub async fn unassign_device(&self, device_id: &DeviceId) -> Option<ParticipantId> {
        let owner = self.registry.write().await.unassign_device(device_id);
        if owner.is_some() {
            if let Some(table) = self.associations.lock().await.as_mut() {
                table.forget_device(device_id);
            }
        }
        owner
    }

    pub async fn device_state(&self, device_id: &DeviceId) -> Option<LinkState> {
        let supervisor = self
            .devices
            .read()
            .await
            .get(device_id)
            .map(|entry| Arc::clone(&entry.supervisor))?;
        Some(supervisor.state().await)
    }

    async fn device_statuses(&self) -> Vec<DeviceStatus> {
        let entries: Vec<(Arc<ConnectionSupervisor>, Option<String>)> = self
            .devices
            .read()
            .await
            .values()
            .map(|entry| (Arc::clone(&entry.supervisor), entry.last_error.clone()))
            .collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for (supervisor, last_error) in entries {
            let device_id = supervisor.device_id().clone();
            let participant = self.registry.read().await.participant_for_device(&device_id);
            statuses.push(DeviceStatus {
                name: supervisor.sensor().name.clone(),
                state: supervisor.state().await,
                battery_level: supervisor.battery_level().await,
                participant,
                last_error,
                device_id,
            });
        }
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Record a reading. Never waits on membership or persistence.
    pub async fn record_sample(
        self: &Arc<Self>,
        participant: ParticipantId,
        heart_rate: u16,
        at: DateTime<Utc>,
        source: Option<&DeviceId>,
    ) -> SampleOutcome {
        let outcome = self
            .registry
            .write()
            .await
            .record_sample(participant, heart_rate, at, source);

        let zone = match outcome {
            SampleOutcome::Recorded { zone, created } => {
                if created {
                    self.relayout().await;
                    self.spawn_resolution(participant).await;
                }
                zone
            }
            SampleOutcome::Ignored(reason) => {
                log::debug!("Ignoring sample for {}: {:?}", participant, reason);
                return outcome;
            }
        };

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_mut() {
            if active.aggregator.participant() == participant
                && active.aggregator.ingest(heart_rate)
            {
                let sample = StoredSample { at, heart_rate, zone };
                match &mut active.record {
                    RecordState::Creating(pending) => pending.push(sample),
                    RecordState::Saved(session_ref) => self.append_sample(*session_ref, sample),
                    RecordState::Unsaved => {}
                }
            }
        }
        outcome
    }

    /// Fire-and-forget write of one session sample.
    fn append_sample(&self, session_ref: SessionRef, sample: StoredSample) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.append_sample(session_ref, sample).await {
                log::warn!("Failed to persist sample for session {}: {}", session_ref, e);
            }
        });
    }

    /// Remove a participant from the live view. Its device link is closed.
    /// A running session of theirs is paused, not closed; stopping it stays
    /// an explicit operation.
    pub async fn remove_participant(&self, participant: &ParticipantId) -> bool {
        let removed = self.registry.write().await.remove_participant(participant);
        let removed = match removed {
            Some(removed) => removed,
            None => return false,
        };
        if let Some(device) = removed.device {
            if let Some(entry) = self.devices.write().await.remove(&device) {
                entry.supervisor.disconnect().await;
            }
        }

        if let Some(active) = self.session.lock().await.as_mut() {
            if active.aggregator.participant() == *participant {
                if let Some(ticker) = active.ticker.take() {
                    ticker.cancel();
                }
                if active.aggregator.state() == SessionState::Running {
                    if let Err(e) = active.aggregator.pause() {
                        log::warn!("Could not pause session of {}: {}", participant, e);
                    } else {
                        log::info!("Paused session of removed participant {}", participant);
                    }
                }
            }
        }

        self.relayout().await;
        true
    }

    pub async fn participant_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn card(&self, participant: &ParticipantId) -> Option<ParticipantCard> {
        self.registry.read().await.card(participant, Utc::now())
    }

    /// Look up the participant's profile in the background.
    async fn spawn_resolution(self: &Arc<Self>, participant: ParticipantId) {
        let already = self
            .registry
            .read()
            .await
            .get(&participant)
            .map(|p| p.resolved)
            .unwrap_or(true);
        if already {
            return;
        }
        let weak = Arc::downgrade(self);
        let membership = Arc::clone(&self.membership);
        let timeout = self.config.timing.resolution_timeout;
        tokio::spawn(async move {
            let result = resolve_with_timeout(membership.as_ref(), participant, timeout).await;
            let dashboard = match weak.upgrade() {
                Some(dashboard) => dashboard,
                None => return,
            };
            match result {
                Ok(profile) => {
                    let weight = {
                        let mut registry = dashboard.registry.write().await;
                        if registry.apply_profile(&participant, &profile).is_err() {
                            // Removed while the lookup was in flight.
                            return;
                        }
                        registry.get(&participant).map(|p| p.weight_kg)
                    };
                    if let (Some(weight), Some(active)) =
                        (weight, dashboard.session.lock().await.as_mut())
                    {
                        if active.aggregator.participant() == participant {
                            active.aggregator.set_weight(weight);
                        }
                    }
                    log::debug!("Resolved participant {} as {}", participant, profile.name);
                }
                Err(e) => {
                    log::warn!(
                        "Could not resolve participant {}, keeping defaults: {}",
                        participant,
                        e
                    );
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Start the workout session for one participant.
    pub async fn start_session(
        self: &Arc<Self>,
        participant: ParticipantId,
    ) -> Result<(), DashboardError> {
        let weight = {
            let registry = self.registry.read().await;
            let p = registry
                .get(&participant)
                .ok_or(RegistryError::UnknownParticipant(participant))?;
            p.weight_kg
        };

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            if active.aggregator.state() != SessionState::Stopped {
                return Err(DashboardError::SessionAlreadyActive);
            }
        }

        let now = Utc::now();
        let mut aggregator = SessionAggregator::new(participant, weight);
        let generation = aggregator.start(now)?;

        *session = Some(ActiveSession {
            aggregator,
            record: RecordState::Creating(Vec::new()),
            ticker: Some(self.spawn_session_ticker(participant, generation)),
            summary: None,
        });
        drop(session);

        self.spawn_record_creation(participant, now);
        self.save_associations().await;
        Ok(())
    }

    /// Create the stored record in the background. Samples that arrived
    /// meanwhile are written first, in order, before new ones go straight
    /// to the store. A session stopped in the meantime is closed here.
    fn spawn_record_creation(self: &Arc<Self>, participant: ParticipantId, started_at: DateTime<Utc>) {
        let weak = Arc::downgrade(self);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let created = store.create_session(participant, started_at).await;
            let dashboard = match weak.upgrade() {
                Some(dashboard) => dashboard,
                None => return,
            };

            let session_ref = match created {
                Ok(session_ref) => session_ref,
                Err(e) => {
                    log::warn!("Session record not created, continuing unsaved: {}", e);
                    if let Some(active) = dashboard.session.lock().await.as_mut() {
                        if active.aggregator.started_at() == Some(started_at) {
                            active.record = RecordState::Unsaved;
                        }
                    }
                    return;
                }
            };

            let summary = loop {
                let pending = {
                    let mut session = dashboard.session.lock().await;
                    let active = match session.as_mut() {
                        Some(active) if active.aggregator.started_at() == Some(started_at) => active,
                        _ => {
                            log::debug!("Session {} replaced before its record was ready", session_ref);
                            return;
                        }
                    };
                    let pending = match &mut active.record {
                        RecordState::Creating(pending) => std::mem::take(pending),
                        _ => Vec::new(),
                    };
                    if pending.is_empty() {
                        active.record = RecordState::Saved(session_ref);
                        break active.summary.clone();
                    }
                    pending
                };
                for sample in pending {
                    if let Err(e) = store.append_sample(session_ref, sample).await {
                        log::warn!("Failed to persist sample for session {}: {}", session_ref, e);
                    }
                }
            };

            if let Some(summary) = summary {
                if let Err(e) = store.close_session(session_ref, &summary).await {
                    log::warn!("Failed to close session {}: {}", session_ref, e);
                }
            }
        });
    }

    fn spawn_session_ticker(self: &Arc<Self>, participant: ParticipantId, generation: u64) -> Ticker {
        let weak = Arc::downgrade(self);
        Ticker::spawn(self.config.timing.session_tick, move || {
            let weak = Weak::clone(&weak);
            async move {
                match weak.upgrade() {
                    Some(dashboard) => dashboard.on_session_tick(participant, generation).await,
                    None => false,
                }
            }
        })
    }

    /// One session second. Returns whether this ticker is still current.
    async fn on_session_tick(&self, participant: ParticipantId, generation: u64) -> bool {
        let zone = self.registry.read().await.get(&participant).map(|p| p.zone);
        // A removed participant accrues nothing.
        let zone = match zone {
            Some(zone) => zone,
            None => return false,
        };

        let mut session = self.session.lock().await;
        match session.as_mut() {
            Some(active) => active.aggregator.tick(generation, zone),
            None => false,
        }
    }

    pub async fn pause_session(&self) -> Result<(), DashboardError> {
        let mut session = self.session.lock().await;
        let active = session.as_mut().ok_or(DashboardError::NoActiveSession)?;
        active.aggregator.pause()?;
        if let Some(ticker) = active.ticker.take() {
            ticker.cancel();
        }
        Ok(())
    }

    pub async fn resume_session(self: &Arc<Self>) -> Result<(), DashboardError> {
        let mut session = self.session.lock().await;
        let active = session.as_mut().ok_or(DashboardError::NoActiveSession)?;
        let generation = active.aggregator.resume()?;
        if let Some(old) = active.ticker.take() {
            old.cancel();
        }
        let participant = active.aggregator.participant();
        active.ticker = Some(self.spawn_session_ticker(participant, generation));
        Ok(())
    }

    /// Stop the session, freeze its statistics and close the stored record.
    pub async fn stop_session(&self) -> Result<SessionSummary, DashboardError> {
        let (summary, session_ref) = {
            let mut session = self.session.lock().await;
            let active = session.as_mut().ok_or(DashboardError::NoActiveSession)?;
            let summary = active.aggregator.stop(Utc::now())?;
            if let Some(ticker) = active.ticker.take() {
                ticker.cancel();
            }
            active.summary = Some(summary.clone());
            let session_ref = match active.record {
                RecordState::Saved(session_ref) => Some(session_ref),
                // Closed by the creating task once the record exists.
                RecordState::Creating(_) | RecordState::Unsaved => None,
            };
            (summary, session_ref)
        };

        if let Some(session_ref) = session_ref {
            if let Err(e) = self.store.close_session(session_ref, &summary).await {
                log::warn!("Failed to close session {}: {}", session_ref, e);
            }
        }
        self.save_associations().await;
        Ok(summary)
    }

    pub async fn session_snapshot(&self) -> Option<SessionSnapshot> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|active| active.aggregator.snapshot())
    }

    async fn save_associations(&self) {
        if let Some(table) = self.associations.lock().await.as_ref() {
            if let Err(e) = table.save() {
                log::warn!("Failed to save device pairings to {}: {}", table.path().display(), e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Layout & rendering
    // ------------------------------------------------------------------

    /// Viewport resize signal. Applied once resizing settles.
    pub async fn viewport_changed(self: &Arc<Self>, width: f64, height: f64) {
        let weak = Arc::downgrade(self);
        self.resize.lock().await.call(async move {
            if let Some(dashboard) = weak.upgrade() {
                dashboard.set_viewport(Viewport::new(width, height)).await;
            }
        });
    }

    /// Apply a viewport immediately, e.g. on first load.
    pub async fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.write().await = viewport;
        self.relayout().await;
    }

    pub async fn viewport(&self) -> Viewport {
        *self.viewport.read().await
    }

    pub async fn layout(&self) -> GridLayout {
        *self.layout.read().await
    }

    /// Recompute the grid and publish a frame if it changed.
    pub async fn relayout(&self) -> GridLayout {
        let count = self.registry.read().await.len();
        let viewport = *self.viewport.read().await;
        let layout = compute_grid(count, viewport, &self.config.layout);

        let changed = {
            let mut current = self.layout.write().await;
            let changed = *current != layout;
            *current = layout;
            changed
        };
        if changed {
            self.publish_frame().await;
        }
        layout
    }

    pub async fn render_frame(&self) -> RenderFrame {
        let now = Utc::now();
        let (cards, stats) = {
            let registry = self.registry.read().await;
            (registry.cards(now), registry.global_stats(now))
        };
        RenderFrame {
            generated_at: now,
            viewport: *self.viewport.read().await,
            layout: *self.layout.read().await,
            cards,
            stats,
            session: self.session_snapshot().await,
            devices: self.device_statuses().await,
        }
    }

    async fn publish_frame(&self) {
        let frame = self.render_frame().await;
        // No subscribers is fine.
        let _ = self.frames_tx.send(frame);
    }

    // ------------------------------------------------------------------
    // Supervisor events
    // ------------------------------------------------------------------

    async fn handle_event(self: &Arc<Self>, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Connected {
                device_id,
                battery_level,
            } => {
                self.registry
                    .write()
                    .await
                    .set_battery_level(&device_id, battery_level);
                if let Some(entry) = self.devices.write().await.get_mut(&device_id) {
                    entry.last_error = None;
                }
            }
            SupervisorEvent::Frame {
                device_id,
                frame,
                received_at,
            } => {
                if frame.contact == Some(false) {
                    log::debug!("No skin contact on {}, skipping frame", device_id);
                    return;
                }
                let participant = self.registry.read().await.participant_for_device(&device_id);
                match participant {
                    Some(participant) => {
                        self.record_sample(participant, frame.heart_rate, received_at, Some(&device_id))
                            .await;
                    }
                    None => log::debug!("Frame from unassigned device {}", device_id),
                }
            }
            SupervisorEvent::DeviceDisconnected { device_id } => {
                if self.config.participants.remove_on_disconnect {
                    let owner = self.registry.read().await.participant_for_device(&device_id);
                    if let Some(participant) = owner {
                        log::info!("Removing participant {} after {} disconnected", participant, device_id);
                        self.remove_participant(&participant).await;
                    }
                } else {
                    self.registry.write().await.mark_link_lost(&device_id);
                }
                self.publish_frame().await;
            }
            SupervisorEvent::ReconnectScheduled { .. } => {}
            SupervisorEvent::ReconnectFailed { device_id, error } => {
                if let Some(entry) = self.devices.write().await.get_mut(&device_id) {
                    entry.last_error = Some(error.to_string());
                }
            }
            SupervisorEvent::ReconnectAbandoned {
                device_id,
                attempts,
            } => {
                if let Some(entry) = self.devices.write().await.get_mut(&device_id) {
                    entry.last_error =
                        Some(format!("gave up after {} reconnection attempts", attempts));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::ble::simulated::SimSensorNetwork;
    use crate::ble::transport::SensorLink;
    use crate::membership::{InMemoryDirectory, MemberProfile};
    use crate::storage::InMemorySessionStore;
    use crate::zones::Zone;

    /// Central whose connects to chosen sensors hang.
    struct StallingCentral {
        network: Arc<SimSensorNetwork>,
        stalled: Mutex<HashSet<DeviceId>>,
    }

    #[async_trait]
    impl SensorCentral for StallingCentral {
        async fn start_scan(&self) -> Result<(), ConnectionError> {
            self.network.start_scan().await
        }

        async fn stop_scan(&self) -> Result<(), ConnectionError> {
            self.network.stop_scan().await
        }

        fn discoveries(&self) -> broadcast::Receiver<DiscoveredSensor> {
            self.network.discoveries()
        }

        async fn connect(
            &self,
            sensor: &DiscoveredSensor,
        ) -> Result<Box<dyn SensorLink>, ConnectionError> {
            let stalled = self.stalled.lock().await.contains(&sensor.id);
            if stalled {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.network.connect(sensor).await
        }
    }

    /// Session store that takes `create_delay` to create a record.
    struct SlowStore {
        inner: InMemorySessionStore,
        create_delay: Duration,
    }

    #[async_trait]
    impl SessionStore for SlowStore {
        async fn create_session(
            &self,
            participant: Uuid,
            started_at: DateTime<Utc>,
        ) -> Result<SessionRef, PersistenceError> {
            tokio::time::sleep(self.create_delay).await;
            self.inner.create_session(participant, started_at).await
        }

        async fn append_sample(
            &self,
            session: SessionRef,
            sample: StoredSample,
        ) -> Result<(), PersistenceError> {
            self.inner.append_sample(session, sample).await
        }

        async fn close_session(
            &self,
            session: SessionRef,
            summary: &SessionSummary,
        ) -> Result<(), PersistenceError> {
            self.inner.close_session(session, summary).await
        }
    }

    struct Harness {
        network: Arc<SimSensorNetwork>,
        directory: Arc<InMemoryDirectory>,
        store: Arc<InMemorySessionStore>,
        dashboard: Arc<Dashboard>,
    }

    async fn harness(config: DashboardConfig) -> Harness {
        let network = SimSensorNetwork::new();
        let directory = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemorySessionStore::new());
        let dashboard = Dashboard::new(
            config,
            network.clone(),
            directory.clone(),
            store.clone(),
            None,
        );
        dashboard.start().await;
        Harness {
            network,
            directory,
            store,
            dashboard,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_device_selected() {
        let h = harness(DashboardConfig::default()).await;
        assert!(matches!(
            h.dashboard.connect_device(None, None).await,
            Err(DashboardError::Connection(ConnectionError::NoDeviceSelected))
        ));
        assert_eq!(h.dashboard.participant_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_leaves_no_participant() {
        let h = harness(DashboardConfig::default()).await;
        let sensor = h.network.add_sensor("H10").await;
        h.network.set_permission_denied(true);

        let result = h.dashboard.connect_device(Some(sensor.descriptor().await), None).await;
        assert!(matches!(
            result,
            Err(DashboardError::Connection(ConnectionError::PermissionDenied))
        ));
        assert_eq!(h.dashboard.participant_count().await, 0);

        let frame = h.dashboard.render_frame().await;
        assert_eq!(frame.devices.len(), 1);
        assert!(frame.devices[0].last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_update_participant_card() {
        let h = harness(DashboardConfig::default()).await;
        let sensor = h.network.add_sensor("H10").await;
        let participant = Uuid::new_v4();
        h.directory
            .insert(participant, MemberProfile::new("Alice").with_age(30))
            .await;

        h.dashboard
            .connect_device(Some(sensor.descriptor().await), Some(participant))
            .await
            .unwrap();
        sensor.send_heart_rate(130).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let card = h.dashboard.card(&participant).await.unwrap();
        assert_eq!(card.heart_rate, Some(130));
        assert_eq!(card.zone, Zone::Endurance);
        assert_eq!(card.name, "Alice");
        assert_eq!(card.battery_level, Some(100));
        assert!(!card.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_failure_keeps_defaults() {
        let h = harness(DashboardConfig::default()).await;
        h.directory.set_unavailable(Some("offline".into())).await;

        let participant = Uuid::new_v4();
        let outcome = h
            .dashboard
            .record_sample(participant, 120, Utc::now(), None)
            .await;
        assert!(matches!(outcome, SampleOutcome::Recorded { created: true, .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let card = h.dashboard.card(&participant).await.unwrap();
        assert_eq!(card.name, crate::live::registry::DEFAULT_PARTICIPANT_NAME);
        assert_eq!(card.heart_rate, Some(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_marks_stale_then_recovers() {
        let h = harness(DashboardConfig::default()).await;
        let sensor = h.network.add_sensor("H10").await;
        let participant = h
            .dashboard
            .connect_device(Some(sensor.descriptor().await), None)
            .await
            .unwrap();
        sensor.send_heart_rate(110).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        sensor.drop_link().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.dashboard.card(&participant).await.unwrap().stale);
        assert_eq!(h.dashboard.participant_count().await, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            h.dashboard.device_state(sensor.id()).await,
            Some(LinkState::Subscribed)
        );
        sensor.send_heart_rate(112).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let card = h.dashboard.card(&participant).await.unwrap();
        assert!(!card.stale);
        assert_eq!(card.heart_rate, Some(112));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tv_mode_removes_on_disconnect() {
        let mut config = DashboardConfig::default();
        config.participants.remove_on_disconnect = true;
        let h = harness(config).await;
        let sensor = h.network.add_sensor("H10").await;
        h.dashboard
            .connect_device(Some(sensor.descriptor().await), None)
            .await
            .unwrap();
        assert_eq!(h.dashboard.participant_count().await, 1);

        sensor.drop_link().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.dashboard.participant_count().await, 0);
        assert_eq!(h.dashboard.layout().await, GridLayout::Empty);

        // The device was released, so no reconnection happens.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!sensor.is_linked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ticks_once_per_second() {
        let h = harness(DashboardConfig::default()).await;
        let participant = Uuid::new_v4();
        h.dashboard
            .record_sample(participant, 150, Utc::now(), None)
            .await;
        h.dashboard.start_session(participant).await.unwrap();
        assert!(matches!(
            h.dashboard.start_session(participant).await,
            Err(DashboardError::SessionAlreadyActive)
        ));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let snapshot = h.dashboard.session_snapshot().await.unwrap();
        assert_eq!(snapshot.elapsed_seconds, 10);

        h.dashboard.pause_session().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.dashboard.resume_session().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let summary = h.dashboard.stop_session().await.unwrap();
        assert_eq!(summary.elapsed_seconds, 12);
        let tempo = summary
            .zone_times
            .iter()
            .find(|t| t.zone == Zone::Tempo)
            .unwrap();
        assert_eq!(tempo.seconds, 12);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            h.dashboard.session_snapshot().await.unwrap().elapsed_seconds,
            12
        );
        assert_eq!(h.store.session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_outage_does_not_affect_display() {
        let h = harness(DashboardConfig::default()).await;
        h.store.set_failing(true);
        let participant = Uuid::new_v4();
        h.dashboard
            .record_sample(participant, 100, Utc::now(), None)
            .await;
        h.dashboard.start_session(participant).await.unwrap();

        for hr in [100u16, 120, 80] {
            h.dashboard
                .record_sample(participant, hr, Utc::now(), None)
                .await;
        }
        let summary = h.dashboard.stop_session().await.unwrap();
        assert_eq!(summary.average_heart_rate, Some(100));
        assert_eq!(summary.max_heart_rate, Some(120));
        assert_eq!(summary.min_heart_rate, Some(80));
        assert_eq!(h.dashboard.card(&participant).await.unwrap().heart_rate, Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_is_debounced() {
        let h = harness(DashboardConfig::default()).await;
        for i in 0..3 {
            h.dashboard
                .record_sample(Uuid::new_v4(), 100 + i, Utc::now(), None)
                .await;
        }
        let before = h.dashboard.viewport().await;

        h.dashboard.viewport_changed(1000.0, 800.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.dashboard.viewport_changed(1280.0, 720.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.dashboard.viewport().await, before);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.dashboard.viewport().await, Viewport::new(1280.0, 720.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let h = harness(DashboardConfig::default()).await;
        let participant = Uuid::new_v4();
        h.dashboard
            .record_sample(participant, 100, Utc::now(), None)
            .await;
        h.dashboard.start_session(participant).await.unwrap();
        let mut frames = h.dashboard.subscribe();

        h.dashboard.stop().await;
        let elapsed = h.dashboard.session_snapshot().await.unwrap().elapsed_seconds;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            h.dashboard.session_snapshot().await.unwrap().elapsed_seconds,
            elapsed
        );
        assert!(matches!(
            frames.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reconnect_does_not_block_other_devices() {
        let network = SimSensorNetwork::new();
        let central = Arc::new(StallingCentral {
            network: network.clone(),
            stalled: Mutex::new(HashSet::new()),
        });
        let dashboard = Dashboard::new(
            DashboardConfig::default(),
            central.clone(),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemorySessionStore::new()),
            None,
        );
        dashboard.start().await;

        let healthy = network.add_sensor("A").await;
        let flaky = network.add_sensor("B").await;
        let other = network.add_sensor("C").await;
        let a = dashboard
            .connect_device(Some(healthy.descriptor().await), None)
            .await
            .unwrap();
        for sensor in [&flaky, &other] {
            dashboard
                .connect_device(Some(sensor.descriptor().await), None)
                .await
                .unwrap();
        }

        central.stalled.lock().await.insert(flaky.id().clone());
        flaky.drop_link().await;
        // B's automatic retry fires at 3 s and hangs in connect.
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), dashboard.render_frame())
            .await
            .unwrap();
        let status = frame.devices.iter().find(|d| &d.device_id == flaky.id()).unwrap();
        assert_eq!(status.state, LinkState::Connecting);

        // Another loss makes the event loop publish a frame.
        other.drop_link().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        healthy.send_heart_rate(123).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dashboard.card(&a).await.unwrap().heart_rate, Some(123));

        // The hung attempt is abandoned at the connect timeout.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(
            dashboard.device_state(flaky.id()).await,
            Some(LinkState::Disconnected)
        );
        let frame = dashboard.render_frame().await;
        let status = frame.devices.iter().find(|d| &d.device_id == flaky.id()).unwrap();
        assert!(status.last_error.is_some());

        dashboard.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_does_not_hold_up_samples() {
        let store = Arc::new(SlowStore {
            inner: InMemorySessionStore::new(),
            create_delay: Duration::from_secs(30),
        });
        let dashboard = Dashboard::new(
            DashboardConfig::default(),
            SimSensorNetwork::new(),
            Arc::new(InMemoryDirectory::new()),
            store.clone(),
            None,
        );
        dashboard.start().await;

        let participant = Uuid::new_v4();
        dashboard
            .record_sample(participant, 140, Utc::now(), None)
            .await;
        tokio::time::timeout(Duration::from_secs(1), dashboard.start_session(participant))
            .await
            .unwrap()
            .unwrap();
        for hr in [150u16, 160] {
            tokio::time::timeout(
                Duration::from_secs(1),
                dashboard.record_sample(participant, hr, Utc::now(), None),
            )
            .await
            .unwrap();
        }
        let snapshot = dashboard.session_snapshot().await.unwrap();
        assert_eq!(snapshot.max_heart_rate, Some(160));
        assert_eq!(store.inner.session_count().await, 0);

        // Once the record exists the buffered samples land in order, and
        // later samples follow them.
        tokio::time::sleep(Duration::from_secs(31)).await;
        dashboard
            .record_sample(participant, 170, Utc::now(), None)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = store.inner.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0]
                .samples
                .iter()
                .map(|s| s.heart_rate)
                .collect::<Vec<_>>(),
            vec![150, 160, 170]
        );
        dashboard.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stopped_before_record_exists_is_closed_later() {
        let store = Arc::new(SlowStore {
            inner: InMemorySessionStore::new(),
            create_delay: Duration::from_secs(30),
        });
        let dashboard = Dashboard::new(
            DashboardConfig::default(),
            SimSensorNetwork::new(),
            Arc::new(InMemoryDirectory::new()),
            store.clone(),
            None,
        );
        dashboard.start().await;

        let participant = Uuid::new_v4();
        dashboard
            .record_sample(participant, 120, Utc::now(), None)
            .await;
        dashboard.start_session(participant).await.unwrap();
        dashboard
            .record_sample(participant, 130, Utc::now(), None)
            .await;
        let summary = dashboard.stop_session().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let records = store.inner.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].samples.len(), 1);
        assert_eq!(records[0].summary, Some(summary));
        dashboard.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_session_participant_pauses_session() {
        let h = harness(DashboardConfig::default()).await;
        let participant = Uuid::new_v4();
        h.dashboard
            .record_sample(participant, 150, Utc::now(), None)
            .await;
        h.dashboard.start_session(participant).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(h.dashboard.remove_participant(&participant).await);
        tokio::time::sleep(Duration::from_secs(20)).await;

        let snapshot = h.dashboard.session_snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Paused);
        assert_eq!(snapshot.elapsed_seconds, 3);
        let seconds = |zone: Zone| {
            snapshot
                .zone_times
                .iter()
                .find(|t| t.zone == zone)
                .map(|t| t.seconds)
                .unwrap()
        };
        assert_eq!(seconds(Zone::Tempo), 3);
        assert_eq!(seconds(Zone::Unclassified), 0);

        // Still open: the operator closes it explicitly.
        let summary = h.dashboard.stop_session().await.unwrap();
        assert_eq!(summary.elapsed_seconds, 3);
    }
}
