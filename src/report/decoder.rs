//! Report header and sample stream decoding.
//!
//! Header layout (10 bytes):
//!
//! ```text
//! offset  0    1    2    3    4    5    6    7    8  9
//!         YY   MM   DD   hh   --   mm   ss   MO   delta
//! ```
//!
//! The date and time fields are packed BCD. Byte 6 is read twice: as BCD
//! seconds for the start time, and as a binary reading interval for the
//! end time, which is how the device reports it. `delta` is a big-endian
//! 16-bit count.
//!
//! Samples come in 3-byte groups `[spo2, reserved, pulse]`.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 10;
const SAMPLE_GROUP: usize = 3;

const MODE_ADULT: u8 = 0x22;
const MODE_PEDIATRIC: u8 = 0x42;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Header must be {HEADER_LEN} bytes, got {0}")]
    HeaderLength(usize),

    #[error("Invalid timestamp in header: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Adult,
    Pediatric,
    Unknown,
}

impl Mode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            MODE_ADULT => Mode::Adult,
            MODE_PEDIATRIC => Mode::Pediatric,
            _ => Mode::Unknown,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Adult => "Adult",
            Mode::Pediatric => "Pediatric",
            Mode::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub interval_seconds: u8,
    pub mode: Mode,
    pub delta: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Samples {
    pub sp02: Vec<u8>,
    pub pulse: Vec<u8>,
}

impl Samples {
    pub fn len(&self) -> usize {
        self.sp02.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sp02.is_empty()
    }
}

fn bcd(byte: u8, field: &str) -> Result<u32> {
    let (hi, lo) = (byte >> 4, byte & 0x0F);
    if hi > 9 || lo > 9 {
        return Err(DecodeError::InvalidTimestamp(format!(
            "{} byte {:02x} is not BCD",
            field, byte
        )));
    }
    Ok(u32::from(hi) * 10 + u32::from(lo))
}

pub fn decode_header(bytes: &[u8]) -> Result<HeaderInfo> {
    if bytes.len() != HEADER_LEN {
        return Err(DecodeError::HeaderLength(bytes.len()));
    }

    let year = 2000 + bcd(bytes[0], "year")? as i32;
    let month = bcd(bytes[1], "month")?;
    let day = bcd(bytes[2], "day")?;
    let hour = bcd(bytes[3], "hour")?;
    let minute = bcd(bytes[5], "minute")?;
    let second = bcd(bytes[6], "second")?;

    let start = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or_else(|| {
            DecodeError::InvalidTimestamp(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })?;

    let interval_seconds = bytes[6];
    let delta = u16::from_be_bytes([bytes[8], bytes[9]]);
    let interval = i64::from(interval_seconds);
    // Not clamped: a delta below 3 puts the end before the start.
    let span = i64::from(delta / 3) * interval - interval;

    Ok(HeaderInfo {
        start,
        end: start + Duration::seconds(span),
        interval_seconds,
        mode: Mode::from_byte(bytes[7]),
        delta,
    })
}

pub fn decode_samples(bytes: &[u8]) -> Samples {
    let groups = bytes.chunks_exact(SAMPLE_GROUP);
    let mut samples = Samples {
        sp02: Vec::with_capacity(groups.len()),
        pulse: Vec::with_capacity(groups.len()),
    };
    for group in groups {
        samples.sp02.push(group[0]);
        samples.pulse.push(group[2]);
    }
    samples
}
