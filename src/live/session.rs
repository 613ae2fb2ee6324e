//! Session aggregator
//!
//! Rolls up one participant's supervised workout: heart-rate statistics,
//! seconds spent in each zone, and an energy estimate. Zone time and the
//! session clock only advance on the 1 Hz tick, never on samples, so a
//! fast sensor cannot inflate zone time.
//!
//! Each `start`/`resume` issues a new tick generation. Ticks carrying any
//! other generation are ignored, which keeps a leftover timer from
//! double-advancing the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::zones::Zone;

/// Energy cost (MET) of time spent in each zone, indexed by zone number.
pub const ZONE_METS: [f64; 6] = [5.0, 3.0, 5.0, 7.0, 9.0, 12.0];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not running")]
    NotRunning,

    #[error("Session is not paused")]
    NotPaused,

    #[error("Session already stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

/// Seconds spent in one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneTime {
    pub zone: Zone,
    pub seconds: u64,
}

/// Live view of a session, rendered every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub participant: Uuid,
    pub state: SessionState,
    pub elapsed_seconds: u64,
    pub average_heart_rate: Option<u16>,
    pub max_heart_rate: Option<u16>,
    pub min_heart_rate: Option<u16>,
    pub zone_times: Vec<ZoneTime>,
    pub calories: u32,
}

/// Frozen statistics of a stopped session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub participant: Uuid,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub average_heart_rate: Option<u16>,
    pub max_heart_rate: Option<u16>,
    pub min_heart_rate: Option<u16>,
    pub zone_times: Vec<ZoneTime>,
    pub calories: u32,
    pub samples: u64,
}

pub struct SessionAggregator {
    participant: Uuid,
    weight_kg: f64,
    state: SessionState,
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    elapsed_seconds: u64,
    zone_seconds: [u64; 6],
    heart_rate_sum: u64,
    samples: u64,
    max_heart_rate: Option<u16>,
    min_heart_rate: Option<u16>,
    calories: u32,
}

impl SessionAggregator {
    pub fn new(participant: Uuid, weight_kg: f64) -> Self {
        Self {
            participant,
            weight_kg,
            state: SessionState::NotStarted,
            generation: 0,
            started_at: None,
            elapsed_seconds: 0,
            zone_seconds: [0; 6],
            heart_rate_sum: 0,
            samples: 0,
            max_heart_rate: None,
            min_heart_rate: None,
            calories: 0,
        }
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Generation that ticks must carry to be counted.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn zone_seconds(&self, zone: Zone) -> u64 {
        self.zone_seconds[zone.index() as usize]
    }

    pub fn average_heart_rate(&self) -> Option<u16> {
        if self.samples == 0 {
            return None;
        }
        Some(((self.heart_rate_sum + self.samples / 2) / self.samples) as u16)
    }

    pub fn max_heart_rate(&self) -> Option<u16> {
        self.max_heart_rate
    }

    pub fn min_heart_rate(&self) -> Option<u16> {
        self.min_heart_rate
    }

    pub fn calories(&self) -> u32 {
        self.calories
    }

    pub fn set_weight(&mut self, weight_kg: f64) {
        self.weight_kg = weight_kg;
        self.recompute_calories();
    }

    /// Start the clock. Returns the tick generation.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<u64, SessionError> {
        match self.state {
            SessionState::NotStarted => {
                self.started_at = Some(now);
                self.state = SessionState::Running;
                self.generation += 1;
                Ok(self.generation)
            }
            SessionState::Stopped => Err(SessionError::AlreadyStopped),
            _ => Err(SessionError::AlreadyStarted),
        }
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Running => {
                self.state = SessionState::Paused;
                // Invalidate the running ticker.
                self.generation += 1;
                Ok(())
            }
            SessionState::Stopped => Err(SessionError::AlreadyStopped),
            _ => Err(SessionError::NotRunning),
        }
    }

    /// Resume after a pause. Returns the new tick generation.
    pub fn resume(&mut self) -> Result<u64, SessionError> {
        match self.state {
            SessionState::Paused => {
                self.state = SessionState::Running;
                self.generation += 1;
                Ok(self.generation)
            }
            SessionState::Stopped => Err(SessionError::AlreadyStopped),
            _ => Err(SessionError::NotPaused),
        }
    }

    /// Advance the clock by one second, crediting `zone`.
    /// Returns whether the tick was counted.
    pub fn tick(&mut self, generation: u64, zone: Zone) -> bool {
        if self.state != SessionState::Running || generation != self.generation {
            return false;
        }
        self.elapsed_seconds += 1;
        self.zone_seconds[zone.index() as usize] += 1;
        self.recompute_calories();
        true
    }

    /// Fold one accepted sample into the statistics. Ignored unless running.
    pub fn ingest(&mut self, heart_rate: u16) -> bool {
        if self.state != SessionState::Running || heart_rate == 0 {
            return false;
        }
        self.heart_rate_sum += heart_rate as u64;
        self.samples += 1;
        self.max_heart_rate = Some(self.max_heart_rate.map_or(heart_rate, |m| m.max(heart_rate)));
        self.min_heart_rate = Some(self.min_heart_rate.map_or(heart_rate, |m| m.min(heart_rate)));
        self.recompute_calories();
        true
    }

    fn recompute_calories(&mut self) {
        let kcal: f64 = self
            .zone_seconds
            .iter()
            .zip(ZONE_METS.iter())
            .map(|(seconds, met)| met * self.weight_kg * (*seconds as f64 / 3600.0))
            .sum();
        self.calories = kcal.round().max(0.0) as u32;
    }

    fn zone_times(&self) -> Vec<ZoneTime> {
        std::iter::once(Zone::Unclassified)
            .chain(Zone::ALL)
            .map(|zone| ZoneTime {
                zone,
                seconds: self.zone_seconds(zone),
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participant: self.participant,
            state: self.state,
            elapsed_seconds: self.elapsed_seconds,
            average_heart_rate: self.average_heart_rate(),
            max_heart_rate: self.max_heart_rate,
            min_heart_rate: self.min_heart_rate,
            zone_times: self.zone_times(),
            calories: self.calories,
        }
    }

    /// Stop the session and freeze its statistics.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<SessionSummary, SessionError> {
        let started_at = match (self.state, self.started_at) {
            (SessionState::Stopped, _) => return Err(SessionError::AlreadyStopped),
            (SessionState::NotStarted, _) | (_, None) => return Err(SessionError::NotRunning),
            (_, Some(started_at)) => started_at,
        };
        self.state = SessionState::Stopped;
        self.generation += 1;

        Ok(SessionSummary {
            participant: self.participant,
            started_at,
            stopped_at: now,
            elapsed_seconds: self.elapsed_seconds,
            average_heart_rate: self.average_heart_rate(),
            max_heart_rate: self.max_heart_rate,
            min_heart_rate: self.min_heart_rate,
            zone_times: self.zone_times(),
            calories: self.calories,
            samples: self.samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> (SessionAggregator, u64) {
        let mut session = SessionAggregator::new(Uuid::new_v4(), 75.0);
        let generation = session.start(Utc::now()).unwrap();
        (session, generation)
    }

    #[test]
    fn test_running_statistics() {
        let (mut session, _) = running();
        for hr in [100, 120, 80] {
            assert!(session.ingest(hr));
        }
        assert_eq!(session.average_heart_rate(), Some(100));
        assert_eq!(session.max_heart_rate(), Some(120));
        assert_eq!(session.min_heart_rate(), Some(80));
    }

    #[test]
    fn test_average_rounds_to_nearest() {
        let (mut session, _) = running();
        session.ingest(100);
        session.ingest(101);
        assert_eq!(session.average_heart_rate(), Some(101));
        session.ingest(100);
        assert_eq!(session.average_heart_rate(), Some(100));
    }

    #[test]
    fn test_fresh_session_has_no_statistics() {
        let (session, _) = running();
        assert_eq!(session.average_heart_rate(), None);
        assert_eq!(session.min_heart_rate(), None);
        assert_eq!(session.max_heart_rate(), None);
    }

    #[test]
    fn test_zone_time_independent_of_sample_rate() {
        for samples_per_tick in [0usize, 1, 5] {
            let (mut session, generation) = running();
            for _ in 0..10 {
                for _ in 0..samples_per_tick {
                    session.ingest(150);
                }
                assert!(session.tick(generation, Zone::Tempo));
            }
            assert_eq!(session.elapsed_seconds(), 10);
            assert_eq!(session.zone_seconds(Zone::Tempo), 10);
            for zone in [
                Zone::Unclassified,
                Zone::Recovery,
                Zone::Endurance,
                Zone::Threshold,
                Zone::Vo2Max,
            ] {
                assert_eq!(session.zone_seconds(zone), 0);
            }
        }
    }

    #[test]
    fn test_stale_generation_does_not_advance() {
        let (mut session, first) = running();
        assert!(session.tick(first, Zone::Recovery));

        session.pause().unwrap();
        assert!(!session.tick(first, Zone::Recovery));
        assert!(!session.ingest(120));

        let second = session.resume().unwrap();
        assert_ne!(first, second);
        // A ticker left over from before the pause must not count.
        assert!(!session.tick(first, Zone::Recovery));
        assert!(session.tick(second, Zone::Recovery));
        assert_eq!(session.elapsed_seconds(), 2);
    }

    #[test]
    fn test_state_transitions() {
        let mut session = SessionAggregator::new(Uuid::new_v4(), 75.0);
        assert_eq!(session.pause(), Err(SessionError::NotRunning));
        assert_eq!(session.resume(), Err(SessionError::NotPaused));
        assert!(session.stop(Utc::now()).is_err());

        session.start(Utc::now()).unwrap();
        assert_eq!(session.start(Utc::now()), Err(SessionError::AlreadyStarted));
        assert_eq!(session.resume(), Err(SessionError::NotPaused));

        session.pause().unwrap();
        assert_eq!(session.pause(), Err(SessionError::NotRunning));

        session.stop(Utc::now()).unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.start(Utc::now()), Err(SessionError::AlreadyStopped));
        assert_eq!(session.stop(Utc::now()).err(), Some(SessionError::AlreadyStopped));
    }

    #[test]
    fn test_calories_from_zone_time() {
        let (mut session, generation) = running();
        // One hour in zone 5 at 75 kg: 12 MET * 75 kg * 1 h = 900 kcal.
        for _ in 0..3600 {
            session.tick(generation, Zone::Vo2Max);
        }
        assert_eq!(session.calories(), 900);

        session.set_weight(50.0);
        assert_eq!(session.calories(), 600);
    }

    #[test]
    fn test_stop_freezes_summary() {
        let (mut session, generation) = running();
        session.ingest(130);
        session.tick(generation, Zone::Endurance);
        let summary = session.stop(Utc::now()).unwrap();

        assert_eq!(summary.elapsed_seconds, 1);
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.average_heart_rate, Some(130));
        assert_eq!(summary.zone_times.len(), 6);
        assert_eq!(summary.zone_times[2], ZoneTime { zone: Zone::Endurance, seconds: 1 });

        assert!(!session.tick(generation, Zone::Endurance));
        assert!(!session.ingest(150));
        assert_eq!(session.elapsed_seconds(), 1);
    }
}
