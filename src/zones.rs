//! Heart-rate zone classification
//!
//! A zone table holds five ordered lower bounds, either as percentages of a
//! participant's maximum heart rate or as absolute BPM. Bounds are
//! inclusive-lower: a reading exactly on a boundary belongs to the higher
//! zone. Readings under the first bound are unclassified.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Age assumed when a participant's age is unknown.
pub const DEFAULT_AGE: u8 = 30;

/// Estimate maximum heart rate from age (220 - age).
pub fn max_heart_rate_for_age(age: u8) -> u16 {
    220u16.saturating_sub(age as u16).max(1)
}

/// Default maximum heart rate for participants with unknown age.
pub fn default_max_heart_rate() -> u16 {
    max_heart_rate_for_age(DEFAULT_AGE)
}

/// Physiological intensity zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Zone {
    /// Below the lowest band.
    Unclassified,
    Recovery,
    Endurance,
    Tempo,
    Threshold,
    Vo2Max,
}

impl Zone {
    /// The five classified zones, lowest first.
    pub const ALL: [Zone; 5] = [
        Zone::Recovery,
        Zone::Endurance,
        Zone::Tempo,
        Zone::Threshold,
        Zone::Vo2Max,
    ];

    /// Zone number: 0 for unclassified, 1..=5 otherwise.
    pub fn index(self) -> u8 {
        match self {
            Zone::Unclassified => 0,
            Zone::Recovery => 1,
            Zone::Endurance => 2,
            Zone::Tempo => 3,
            Zone::Threshold => 4,
            Zone::Vo2Max => 5,
        }
    }

    /// Inverse of [`Zone::index`]; out-of-range numbers are unclassified.
    pub fn from_index(index: u8) -> Zone {
        match index {
            1 => Zone::Recovery,
            2 => Zone::Endurance,
            3 => Zone::Tempo,
            4 => Zone::Threshold,
            5 => Zone::Vo2Max,
            _ => Zone::Unclassified,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Zone::Unclassified => "Warm-up",
            Zone::Recovery => "Recovery",
            Zone::Endurance => "Endurance",
            Zone::Tempo => "Tempo",
            Zone::Threshold => "Threshold",
            Zone::Vo2Max => "VO2 Max",
        }
    }

    /// Display color as `#rrggbb`.
    pub fn color(self) -> &'static str {
        match self {
            Zone::Unclassified => "#64748b",
            Zone::Recovery => "#22c55e",
            Zone::Endurance => "#3b82f6",
            Zone::Tempo => "#eab308",
            Zone::Threshold => "#f97316",
            Zone::Vo2Max => "#ef4444",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZoneTableError {
    #[error("Zone bounds must be strictly increasing (zone {zone} starts at {bound}, previous at {previous})")]
    NotIncreasing { zone: u8, bound: f64, previous: f64 },

    #[error("Zone bound {0} is not a positive finite number")]
    InvalidBound(f64),
}

/// How the zone bounds are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneBasis {
    /// Percent of the participant's maximum heart rate.
    PercentOfMax,
    /// Absolute beats per minute.
    Bpm,
}

/// Five contiguous bands, each given by its inclusive lower bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTable {
    pub basis: ZoneBasis,
    pub lower_bounds: [f64; 5],
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self {
            basis: ZoneBasis::PercentOfMax,
            lower_bounds: [50.0, 60.0, 70.0, 80.0, 90.0],
        }
    }
}

impl ZoneTable {
    /// Build a validated percentage-of-max table.
    pub fn percent_of_max(lower_bounds: [f64; 5]) -> Result<Self, ZoneTableError> {
        let table = Self {
            basis: ZoneBasis::PercentOfMax,
            lower_bounds,
        };
        table.validate()?;
        Ok(table)
    }

    /// Build a validated absolute-BPM table.
    pub fn bpm(lower_bounds: [f64; 5]) -> Result<Self, ZoneTableError> {
        let table = Self {
            basis: ZoneBasis::Bpm,
            lower_bounds,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ZoneTableError> {
        for (i, bound) in self.lower_bounds.iter().enumerate() {
            if !bound.is_finite() || *bound <= 0.0 {
                return Err(ZoneTableError::InvalidBound(*bound));
            }
            if i > 0 && *bound <= self.lower_bounds[i - 1] {
                return Err(ZoneTableError::NotIncreasing {
                    zone: i as u8 + 1,
                    bound: *bound,
                    previous: self.lower_bounds[i - 1],
                });
            }
        }
        Ok(())
    }

    /// Lower bound of each zone in BPM for the given maximum heart rate.
    pub fn bpm_bounds(&self, max_heart_rate: u16) -> [f64; 5] {
        match self.basis {
            ZoneBasis::Bpm => self.lower_bounds,
            ZoneBasis::PercentOfMax => {
                let max = max_heart_rate as f64;
                self.lower_bounds.map(|pct| pct * max / 100.0)
            }
        }
    }

    /// Classify a heart rate. Pure in `heart_rate` for a fixed table and max.
    pub fn classify(&self, heart_rate: u16, max_heart_rate: u16) -> Zone {
        classify(heart_rate, max_heart_rate, self)
    }
}

/// Scan from the highest band down; the first band whose lower bound is at
/// or below the heart rate wins.
pub fn classify(heart_rate: u16, max_heart_rate: u16, table: &ZoneTable) -> Zone {
    let hr = heart_rate as f64;
    let bounds = table.bpm_bounds(max_heart_rate);
    for (i, bound) in bounds.iter().enumerate().rev() {
        if hr >= *bound {
            return Zone::ALL[i];
        }
    }
    Zone::Unclassified
}

/// Heart rate as a percentage of maximum, rounded to the nearest integer.
pub fn percent_of_max(heart_rate: u16, max_heart_rate: u16) -> u16 {
    if max_heart_rate == 0 {
        return 0;
    }
    ((heart_rate as u32 * 100 + max_heart_rate as u32 / 2) / max_heart_rate as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_belong_to_higher_zone() {
        let table = ZoneTable::default();
        // maxHR = 200: bounds at 100, 120, 140, 160, 180
        assert_eq!(classify(100, 200, &table), Zone::Recovery);
        assert_eq!(classify(120, 200, &table), Zone::Endurance);
        assert_eq!(classify(140, 200, &table), Zone::Tempo);
        assert_eq!(classify(160, 200, &table), Zone::Threshold);
        assert_eq!(classify(180, 200, &table), Zone::Vo2Max);

        assert_eq!(classify(119, 200, &table), Zone::Recovery);
        assert_eq!(classify(179, 200, &table), Zone::Threshold);
    }

    #[test]
    fn test_edges() {
        let table = ZoneTable::default();
        assert_eq!(classify(0, 200, &table), Zone::Unclassified);
        assert_eq!(classify(99, 200, &table), Zone::Unclassified);
        // At or above max stays in the top zone.
        assert_eq!(classify(200, 200, &table), Zone::Vo2Max);
        assert_eq!(classify(250, 200, &table), Zone::Vo2Max);
    }

    #[test]
    fn test_classification_is_pure() {
        let table = ZoneTable::default();
        let sequence = [150u16, 90, 150, 181, 150];
        let first: Vec<Zone> = sequence.iter().map(|hr| classify(*hr, 200, &table)).collect();
        let second: Vec<Zone> = sequence.iter().map(|hr| classify(*hr, 200, &table)).collect();
        assert_eq!(first, second);
        // No hysteresis: same reading, same zone, regardless of history.
        assert_eq!(first[0], first[2]);
        assert_eq!(first[2], first[4]);
    }

    #[test]
    fn test_bpm_table() {
        let table = ZoneTable::bpm([95.0, 114.0, 133.0, 152.0, 171.0]).unwrap();
        assert_eq!(table.classify(94, 0), Zone::Unclassified);
        assert_eq!(table.classify(95, 0), Zone::Recovery);
        assert_eq!(table.classify(171, 0), Zone::Vo2Max);
    }

    #[test]
    fn test_validation() {
        assert!(ZoneTable::default().validate().is_ok());
        assert!(matches!(
            ZoneTable::percent_of_max([50.0, 60.0, 60.0, 80.0, 90.0]),
            Err(ZoneTableError::NotIncreasing { zone: 3, .. })
        ));
        assert!(matches!(
            ZoneTable::bpm([0.0, 60.0, 70.0, 80.0, 90.0]),
            Err(ZoneTableError::InvalidBound(_))
        ));
        assert!(ZoneTable::percent_of_max([50.0, 60.0, f64::NAN, 80.0, 90.0]).is_err());
    }

    #[test]
    fn test_max_heart_rate_for_age() {
        assert_eq!(max_heart_rate_for_age(30), 190);
        assert_eq!(default_max_heart_rate(), 190);
        assert_eq!(max_heart_rate_for_age(0), 220);
        assert_eq!(max_heart_rate_for_age(255), 1);
    }

    #[test]
    fn test_zone_index_round_trip() {
        for zone in Zone::ALL {
            assert_eq!(Zone::from_index(zone.index()), zone);
        }
        assert_eq!(Zone::from_index(0), Zone::Unclassified);
        assert_eq!(Zone::from_index(9), Zone::Unclassified);
    }

    #[test]
    fn test_percent_of_max() {
        assert_eq!(percent_of_max(130, 190), 68);
        assert_eq!(percent_of_max(190, 190), 100);
        assert_eq!(percent_of_max(50, 0), 0);
    }
}
