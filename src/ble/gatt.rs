//! GATT identifiers and Heart Rate Measurement frame decoding
//!
//! Heart-rate sensors advertise the standard Heart Rate service and push
//! Heart Rate Measurement notifications. Byte 0 of every notification is a
//! flags byte; bit 0 selects an 8-bit or little-endian 16-bit heart-rate
//! field, and the remaining bits announce optional trailing fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = bluetooth_uuid(0x180D);

/// Heart Rate Measurement characteristic (notify).
pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid(0x2A37);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = bluetooth_uuid(0x180F);

/// Battery Level characteristic (read, one byte percentage).
pub const BATTERY_LEVEL: Uuid = bluetooth_uuid(0x2A19);

const FLAG_HR_16BIT: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

/// Errors produced while decoding a notification payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,

    #[error("Truncated {field}: need {needed} bytes, got {got}")]
    Truncated {
        field: &'static str,
        needed: usize,
        got: usize,
    },
}

/// One decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateFrame {
    /// Beats per minute.
    pub heart_rate: u16,
    /// Skin contact status; `None` when the sensor does not report it.
    pub contact: Option<bool>,
    /// Cumulative energy expended in kilojoules, when present.
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in milliseconds, oldest first.
    pub rr_intervals_ms: Vec<u16>,
}

impl HeartRateFrame {
    /// Whether the sensor positively reports skin contact.
    /// Sensors without contact detection are assumed to be worn.
    pub fn is_contact_detected(&self) -> bool {
        self.contact.unwrap_or(true)
    }
}

fn read_u16(data: &[u8], offset: usize, field: &'static str) -> Result<u16, DecodeError> {
    if data.len() < offset + 2 {
        return Err(DecodeError::Truncated {
            field,
            needed: offset + 2,
            got: data.len(),
        });
    }
    Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

/// Decode a raw Heart Rate Measurement payload.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateFrame, DecodeError> {
    let flags = *data.first().ok_or(DecodeError::Empty)?;
    let mut offset = 1;

    let heart_rate = if flags & FLAG_HR_16BIT != 0 {
        let value = read_u16(data, offset, "heart rate")?;
        offset += 2;
        value
    } else {
        let value = *data.get(offset).ok_or(DecodeError::Truncated {
            field: "heart rate",
            needed: 2,
            got: data.len(),
        })?;
        offset += 1;
        value as u16
    };

    let contact = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    let energy_expended_kj = if flags & FLAG_ENERGY_EXPENDED != 0 {
        let value = read_u16(data, offset, "energy expended")?;
        offset += 2;
        Some(value)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while offset < data.len() {
            let raw = read_u16(data, offset, "RR interval")?;
            offset += 2;
            // 1/1024 s resolution
            rr_intervals_ms.push(((raw as u32 * 1000 + 512) / 1024) as u16);
        }
    }

    Ok(HeartRateFrame {
        heart_rate,
        contact,
        energy_expended_kj,
        rr_intervals_ms,
    })
}

/// Encode a minimal measurement, as a sensor would send it.
pub fn encode_heart_rate(heart_rate: u16) -> Vec<u8> {
    if heart_rate > u8::MAX as u16 {
        let [lo, hi] = heart_rate.to_le_bytes();
        vec![FLAG_HR_16BIT, lo, hi]
    } else {
        vec![0x00, heart_rate as u8]
    }
}
