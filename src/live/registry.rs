//! Participant registry
//!
//! Single owner of live per-participant state: profile, current reading,
//! zone, the trailing history window and which device feeds it. Other
//! components submit samples or read snapshots; nothing else mutates a
//! participant.
//!
//! Ordering is only guaranteed per participant. A sample older than the
//! participant's last update is dropped.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::transport::DeviceId;
use crate::config::ParticipantSettings;
use crate::membership::MemberProfile;
use crate::zones::{classify, max_heart_rate_for_age, percent_of_max, Zone, ZoneTable};

pub type ParticipantId = Uuid;

/// Name shown until membership resolution completes.
pub const DEFAULT_PARTICIPANT_NAME: &str = "Participant";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Device {device} is already assigned to {participant}")]
    DeviceAlreadyAssigned {
        device: DeviceId,
        participant: ParticipantId,
    },

    #[error("Participant {participant} already has device {device}")]
    ParticipantAlreadyLinked {
        participant: ParticipantId,
        device: DeviceId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySample {
    pub at: DateTime<Utc>,
    pub heart_rate: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    High,
    Low,
}

/// Why a sample was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The sensor reported zero, meaning no reading.
    NoReading,
    /// Older than the participant's last update.
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Recorded {
        zone: Zone,
        /// The participant was created by this sample.
        created: bool,
    },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub max_heart_rate: u16,
    pub weight_kg: f64,
    /// Whether the profile came from the member directory.
    pub resolved: bool,
    pub heart_rate: Option<u16>,
    pub zone: Zone,
    pub history: VecDeque<HistorySample>,
    pub last_update: Option<DateTime<Utc>>,
    pub device: Option<DeviceId>,
    pub battery_level: Option<u8>,
    pub link_lost: bool,
}

/// Render-ready view of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantCard {
    pub id: ParticipantId,
    pub name: String,
    pub heart_rate: Option<u16>,
    pub zone: Zone,
    pub zone_label: String,
    pub zone_color: String,
    pub percent_of_max: Option<u16>,
    pub history: Vec<HistorySample>,
    pub battery_level: Option<u8>,
    pub seconds_since_update: Option<i64>,
    pub stale: bool,
    pub alert: Option<Alert>,
}

/// Room-wide figures shown above the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    /// Participants with a fresh reading.
    pub active: usize,
    pub average_heart_rate: Option<u16>,
}

pub struct ParticipantRegistry {
    settings: ParticipantSettings,
    zones: ZoneTable,
    participants: HashMap<ParticipantId, Participant>,
    /// Display order: first seen first.
    order: Vec<ParticipantId>,
    devices: HashMap<DeviceId, ParticipantId>,
}

impl ParticipantRegistry {
    pub fn new(settings: ParticipantSettings, zones: ZoneTable) -> Self {
        Self {
            settings,
            zones,
            participants: HashMap::new(),
            order: Vec::new(),
            devices: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &ParticipantSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn ids(&self) -> &[ParticipantId] {
        &self.order
    }

    pub fn participant_for_device(&self, device: &DeviceId) -> Option<ParticipantId> {
        self.devices.get(device).copied()
    }

    /// Add a participant with default profile values if not already present.
    /// Returns whether it was created.
    pub fn ensure_participant(&mut self, id: ParticipantId) -> bool {
        if self.participants.contains_key(&id) {
            return false;
        }
        self.participants.insert(
            id,
            Participant {
                id,
                name: DEFAULT_PARTICIPANT_NAME.to_string(),
                max_heart_rate: max_heart_rate_for_age(self.settings.default_age),
                weight_kg: self.settings.default_weight_kg,
                resolved: false,
                heart_rate: None,
                zone: Zone::Unclassified,
                history: VecDeque::new(),
                last_update: None,
                device: None,
                battery_level: None,
                link_lost: false,
            },
        );
        self.order.push(id);
        true
    }

    /// Record one reading, creating the participant if unseen.
    pub fn record_sample(
        &mut self,
        id: ParticipantId,
        heart_rate: u16,
        at: DateTime<Utc>,
        source: Option<&DeviceId>,
    ) -> SampleOutcome {
        if heart_rate == 0 {
            return SampleOutcome::Ignored(IgnoreReason::NoReading);
        }
        let created = self.ensure_participant(id);
        let window = ChronoDuration::from_std(self.settings.history_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let zones = &self.zones;
        let participant = match self.participants.get_mut(&id) {
            Some(p) => p,
            None => return SampleOutcome::Ignored(IgnoreReason::NoReading),
        };

        if participant.last_update.map(|last| at < last).unwrap_or(false) {
            return SampleOutcome::Ignored(IgnoreReason::OutOfOrder);
        }

        participant.history.push_back(HistorySample { at, heart_rate });
        let cutoff = at - window;
        while participant
            .history
            .front()
            .map(|s| s.at <= cutoff)
            .unwrap_or(false)
        {
            participant.history.pop_front();
        }

        participant.heart_rate = Some(heart_rate);
        participant.last_update = Some(at);
        participant.zone = classify(heart_rate, participant.max_heart_rate, zones);
        participant.link_lost = false;
        if participant.device.is_none() {
            if let Some(device) = source {
                if !self.devices.contains_key(device) {
                    participant.device = Some(device.clone());
                    self.devices.insert(device.clone(), id);
                }
            }
        }

        SampleOutcome::Recorded {
            zone: participant.zone,
            created,
        }
    }

    /// Replace defaults with a resolved profile and reclassify.
    pub fn apply_profile(
        &mut self,
        id: &ParticipantId,
        profile: &MemberProfile,
    ) -> Result<(), RegistryError> {
        let default_age = self.settings.default_age;
        let default_weight = self.settings.default_weight_kg;
        let participant = self
            .participants
            .get_mut(id)
            .ok_or(RegistryError::UnknownParticipant(*id))?;
        participant.name = profile.name.clone();
        participant.max_heart_rate = profile.resolved_max_heart_rate(default_age);
        participant.weight_kg = profile.weight_kg.unwrap_or(default_weight);
        participant.resolved = true;
        if let Some(hr) = participant.heart_rate {
            participant.zone = classify(hr, participant.max_heart_rate, &self.zones);
        }
        Ok(())
    }

    /// Link a device to a participant. Never overwrites an existing link.
    pub fn assign_device(
        &mut self,
        id: ParticipantId,
        device: DeviceId,
    ) -> Result<(), RegistryError> {
        if let Some(owner) = self.devices.get(&device) {
            if *owner == id {
                return Ok(());
            }
            return Err(RegistryError::DeviceAlreadyAssigned {
                device,
                participant: *owner,
            });
        }
        let participant = self
            .participants
            .get_mut(&id)
            .ok_or(RegistryError::UnknownParticipant(id))?;
        if let Some(existing) = &participant.device {
            return Err(RegistryError::ParticipantAlreadyLinked {
                participant: id,
                device: existing.clone(),
            });
        }
        participant.device = Some(device.clone());
        participant.link_lost = false;
        self.devices.insert(device, id);
        Ok(())
    }

    /// Detach a device from whoever owns it. Returns the former owner.
    pub fn unassign_device(&mut self, device: &DeviceId) -> Option<ParticipantId> {
        let owner = self.devices.remove(device)?;
        if let Some(participant) = self.participants.get_mut(&owner) {
            participant.device = None;
            participant.battery_level = None;
        }
        Some(owner)
    }

    pub fn set_battery_level(&mut self, device: &DeviceId, level: Option<u8>) {
        if let Some(participant) = self
            .devices
            .get(device)
            .and_then(|id| self.participants.get_mut(id))
        {
            participant.battery_level = level;
            participant.link_lost = false;
        }
    }

    /// Flag the participant fed by `device` as stale. Returns it.
    pub fn mark_link_lost(&mut self, device: &DeviceId) -> Option<ParticipantId> {
        let id = *self.devices.get(device)?;
        if let Some(participant) = self.participants.get_mut(&id) {
            participant.link_lost = true;
        }
        Some(id)
    }

    /// Drop a participant and its history. Detaches its device.
    pub fn remove_participant(&mut self, id: &ParticipantId) -> Option<Participant> {
        let participant = self.participants.remove(id)?;
        self.order.retain(|p| p != id);
        if let Some(device) = &participant.device {
            self.devices.remove(device);
        }
        Some(participant)
    }

    pub fn is_stale(&self, participant: &Participant, now: DateTime<Utc>) -> bool {
        if participant.link_lost {
            return true;
        }
        match participant.last_update {
            Some(last) => (now - last)
                .to_std()
                .map(|age| age > self.settings.stale_after)
                .unwrap_or(false),
            None => true,
        }
    }

    pub fn alert_for(&self, heart_rate: u16) -> Option<Alert> {
        if heart_rate > self.settings.high_alert_bpm {
            Some(Alert::High)
        } else if heart_rate < self.settings.low_alert_bpm {
            Some(Alert::Low)
        } else {
            None
        }
    }

    pub fn global_stats(&self, now: DateTime<Utc>) -> GlobalStats {
        let readings: Vec<u16> = self
            .participants
            .values()
            .filter(|p| !self.is_stale(p, now))
            .filter_map(|p| p.heart_rate)
            .collect();
        let average_heart_rate = if readings.is_empty() {
            None
        } else {
            let sum: u64 = readings.iter().map(|hr| *hr as u64).sum();
            let n = readings.len() as u64;
            Some(((sum + n / 2) / n) as u16)
        };
        GlobalStats {
            active: readings.len(),
            average_heart_rate,
        }
    }

    pub fn card(&self, id: &ParticipantId, now: DateTime<Utc>) -> Option<ParticipantCard> {
        let p = self.participants.get(id)?;
        Some(ParticipantCard {
            id: p.id,
            name: p.name.clone(),
            heart_rate: p.heart_rate,
            zone: p.zone,
            zone_label: p.zone.label().to_string(),
            zone_color: p.zone.color().to_string(),
            percent_of_max: p.heart_rate.map(|hr| percent_of_max(hr, p.max_heart_rate)),
            history: p.history.iter().copied().collect(),
            battery_level: p.battery_level,
            seconds_since_update: p.last_update.map(|last| (now - last).num_seconds().max(0)),
            stale: self.is_stale(p, now),
            alert: p.heart_rate.and_then(|hr| self.alert_for(hr)),
        })
    }

    /// Cards in display order.
    pub fn cards(&self, now: DateTime<Utc>) -> Vec<ParticipantCard> {
        self.order
            .iter()
            .filter_map(|id| self.card(id, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ParticipantRegistry {
        ParticipantRegistry::new(ParticipantSettings::default(), ZoneTable::default())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    #[test]
    fn test_first_sample_creates_participant_with_defaults() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        let outcome = reg.record_sample(id, 130, t0(), None);
        assert_eq!(
            outcome,
            SampleOutcome::Recorded {
                zone: Zone::Endurance,
                created: true
            }
        );
        let p = reg.get(&id).unwrap();
        assert_eq!(p.name, DEFAULT_PARTICIPANT_NAME);
        assert_eq!(p.max_heart_rate, 190);
        assert!(!p.resolved);

        assert!(matches!(
            reg.record_sample(id, 131, t0() + secs(1), None),
            SampleOutcome::Recorded { created: false, .. }
        ));
    }

    #[test]
    fn test_history_window_eviction() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        for i in 0..61 {
            reg.record_sample(id, 100 + i as u16, t0() + secs(i), None);
        }
        let p = reg.get(&id).unwrap();
        assert_eq!(p.history.len(), 60);
        let newest = t0() + secs(60);
        assert!(p.history.iter().all(|s| s.at >= newest - secs(60)));
        assert_eq!(p.history.front().unwrap().at, t0() + secs(1));
    }

    #[test]
    fn test_gap_evicts_everything_but_latest() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        for i in 0..10 {
            reg.record_sample(id, 120, t0() + secs(i), None);
        }
        reg.record_sample(id, 125, t0() + secs(300), None);
        assert_eq!(reg.get(&id).unwrap().history.len(), 1);
    }

    #[test]
    fn test_out_of_order_and_zero_samples_dropped() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        reg.record_sample(id, 120, t0() + secs(5), None);
        assert_eq!(
            reg.record_sample(id, 150, t0() + secs(4), None),
            SampleOutcome::Ignored(IgnoreReason::OutOfOrder)
        );
        assert_eq!(
            reg.record_sample(id, 0, t0() + secs(6), None),
            SampleOutcome::Ignored(IgnoreReason::NoReading)
        );
        let p = reg.get(&id).unwrap();
        assert_eq!(p.heart_rate, Some(120));
        assert_eq!(p.history.len(), 1);

        // Per-participant ordering only: another participant may lag behind.
        let other = Uuid::new_v4();
        assert!(matches!(
            reg.record_sample(other, 90, t0(), None),
            SampleOutcome::Recorded { .. }
        ));
    }

    #[test]
    fn test_zone_sequence_reproducible() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        let zones: Vec<Zone> = [70u16, 75, 130, 75]
            .iter()
            .enumerate()
            .map(|(i, hr)| match reg.record_sample(id, *hr, t0() + secs(i as i64 * 3), None) {
                SampleOutcome::Recorded { zone, .. } => zone,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            zones,
            vec![Zone::Unclassified, Zone::Unclassified, Zone::Endurance, Zone::Unclassified]
        );
    }

    #[test]
    fn test_profile_upgrade_reclassifies() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        reg.record_sample(id, 150, t0(), None);
        assert_eq!(reg.get(&id).unwrap().zone, Zone::Tempo);

        let profile = MemberProfile::new("Alice").with_max_heart_rate(160).with_weight(60.0);
        reg.apply_profile(&id, &profile).unwrap();
        let p = reg.get(&id).unwrap();
        assert_eq!(p.name, "Alice");
        assert_eq!(p.max_heart_rate, 160);
        assert_eq!(p.weight_kg, 60.0);
        assert!(p.resolved);
        assert_eq!(p.zone, Zone::Vo2Max);

        let unknown = Uuid::new_v4();
        assert_eq!(
            reg.apply_profile(&unknown, &profile),
            Err(RegistryError::UnknownParticipant(unknown))
        );
    }

    #[test]
    fn test_device_assignment_is_exclusive() {
        let mut reg = registry();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        reg.ensure_participant(alice);
        reg.ensure_participant(bob);
        let strap = DeviceId::Simulated(Uuid::new_v4());
        let spare = DeviceId::Simulated(Uuid::new_v4());

        reg.assign_device(alice, strap.clone()).unwrap();
        reg.assign_device(alice, strap.clone()).unwrap();
        assert_eq!(
            reg.assign_device(bob, strap.clone()),
            Err(RegistryError::DeviceAlreadyAssigned {
                device: strap.clone(),
                participant: alice
            })
        );
        assert!(matches!(
            reg.assign_device(alice, spare.clone()),
            Err(RegistryError::ParticipantAlreadyLinked { .. })
        ));

        assert_eq!(reg.unassign_device(&strap), Some(alice));
        reg.assign_device(bob, strap.clone()).unwrap();
        assert_eq!(reg.participant_for_device(&strap), Some(bob));
        assert_eq!(reg.get(&alice).unwrap().device, None);
    }

    #[test]
    fn test_staleness() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        let strap = DeviceId::Simulated(Uuid::new_v4());
        reg.record_sample(id, 120, t0(), Some(&strap));
        assert_eq!(reg.participant_for_device(&strap), Some(id));

        let p = reg.get(&id).unwrap();
        assert!(!reg.is_stale(p, t0() + secs(10)));
        assert!(reg.is_stale(p, t0() + secs(11)));

        assert_eq!(reg.mark_link_lost(&strap), Some(id));
        assert!(reg.is_stale(reg.get(&id).unwrap(), t0()));

        // A fresh sample clears the flag.
        reg.record_sample(id, 121, t0() + secs(1), Some(&strap));
        assert!(!reg.is_stale(reg.get(&id).unwrap(), t0() + secs(1)));
    }

    #[test]
    fn test_alerts_and_global_stats() {
        let mut reg = registry();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        reg.record_sample(a, 185, t0(), None);
        reg.record_sample(b, 35, t0(), None);
        reg.record_sample(c, 100, t0() - secs(60), None);

        let now = t0() + secs(1);
        assert_eq!(reg.card(&a, now).unwrap().alert, Some(Alert::High));
        assert_eq!(reg.card(&b, now).unwrap().alert, Some(Alert::Low));
        assert_eq!(reg.card(&c, now).unwrap().alert, None);
        assert!(reg.card(&c, now).unwrap().stale);

        // c is stale, so only a and b count: (185 + 35) / 2 = 110
        assert_eq!(
            reg.global_stats(now),
            GlobalStats {
                active: 2,
                average_heart_rate: Some(110)
            }
        );
        assert_eq!(registry().global_stats(now), GlobalStats::default());
    }

    #[test]
    fn test_remove_participant_detaches_device() {
        let mut reg = registry();
        let id = Uuid::new_v4();
        let strap = DeviceId::Simulated(Uuid::new_v4());
        reg.record_sample(id, 120, t0(), Some(&strap));

        let removed = reg.remove_participant(&id).unwrap();
        assert_eq!(removed.device, Some(strap.clone()));
        assert!(reg.is_empty());
        assert!(reg.ids().is_empty());
        assert_eq!(reg.participant_for_device(&strap), None);
        assert!(reg.remove_participant(&id).is_none());
    }

    #[test]
    fn test_cards_keep_first_seen_order() {
        let mut reg = ParticipantRegistry::new(
            ParticipantSettings {
                stale_after: Duration::from_secs(30),
                ..ParticipantSettings::default()
            },
            ZoneTable::default(),
        );
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            reg.record_sample(*id, 140, t0() + secs(i as i64), None);
        }
        let cards = reg.cards(t0() + secs(20));
        assert_eq!(cards.iter().map(|c| c.id).collect::<Vec<_>>(), ids);
        assert_eq!(cards[0].seconds_since_update, Some(20));
        assert_eq!(cards[0].percent_of_max, Some(74));
        assert!(!cards[0].stale);
    }
}
