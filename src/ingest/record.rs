//! # DOA Record Parsing
//!
//! Parses one line of the receiver's measurement file and turns it into a
//! [`TelemetryRecord`].
//!
//! ## Line Format
//!
//! Fields are separated by `", "` and addressed by position:
//!
//! | Index | Field |
//! |-------|-------|
//! | 0 | timestamp (ms) |
//! | 1 | DOA angle (degrees) |
//! | 2 | confidence |
//! | 3 | RSSI |
//! | 4 | frequency (Hz) |
//! | 5 | array arrangement (`UCA`, `ULA`, ...) |
//! | 7 | station id |
//! | 8 | latitude |
//! | 9 | longitude |
//!
//! Lines with fewer than 9 fields are malformed.

use serde::Serialize;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Field separator used by the receiver
pub const FIELD_SEPARATOR: &str = ", ";

/// Minimum number of fields in a well-formed line
pub const MIN_FIELDS: usize = 9;

/// Station id the receiver reports when no call sign is configured
pub const NOCALL: &str = "NOCALL";

/// Circular array; its angle is reported counterclockwise
pub const UCA_ARRANGEMENT: &str = "UCA";

const TIME: usize = 0;
const DOA_ANGLE: usize = 1;
const CONFIDENCE: usize = 2;
const RSSI: usize = 3;
const FREQUENCY_HZ: usize = 4;
const ARRAY_ARRANGEMENT: usize = 5;
const STATION_ID: usize = 7;
const LATITUDE: usize = 8;
const LONGITUDE: usize = 9;

/// Why a line was skipped
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineError {
    #[error("expected at least 9 fields, got {0}")]
    TooFewFields(usize),

    #[error("field {index} ({name}) is not a number: '{value}'")]
    InvalidNumber {
        index: usize,
        name: &'static str,
        value: String,
    },
}

/// Fields of one measurement line, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct DoaLine {
    /// Embedded timestamp, `None` if the field does not parse
    pub timestamp: Option<i64>,
    pub raw_angle: f64,
    pub confidence: f64,
    pub rssi: f64,
    pub frequency_hz: i64,
    pub arrangement: String,
    pub station_id: String,
    pub latitude: f64,
    /// Absent on 9-field lines
    pub longitude: Option<f64>,
}

impl DoaLine {
    /// Station id, unless it is the [`NOCALL`] placeholder
    pub fn alias(&self) -> Option<&str> {
        if self.station_id == NOCALL {
            None
        } else {
            Some(&self.station_id)
        }
    }
}

/// Parse one line of the measurement file
///
/// # Errors
///
/// Returns [`LineError`] if the line has too few fields or a numeric field
/// does not parse.
///
/// # Examples
///
/// ```
/// use kraken_proxy::ingest::record::parse_line;
///
/// let line = parse_line("1700000000000, 90, 0.87, -42.5, 433000000, UCA, 0, OH2X, 60.17, 24.94").unwrap();
/// assert_eq!(line.raw_angle, 90.0);
/// assert_eq!(line.arrangement, "UCA");
/// assert_eq!(line.longitude, Some(24.94));
/// ```
pub fn parse_line(line: &str) -> Result<DoaLine, LineError> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() < MIN_FIELDS {
        return Err(LineError::TooFewFields(fields.len()));
    }

    let longitude = match fields.get(LONGITUDE) {
        Some(value) => Some(parse_float(value, LONGITUDE, "longitude")?),
        None => None,
    };

    Ok(DoaLine {
        timestamp: parse_int(fields[TIME], TIME, "timestamp").ok(),
        raw_angle: parse_float(fields[DOA_ANGLE], DOA_ANGLE, "doa")?,
        confidence: parse_float(fields[CONFIDENCE], CONFIDENCE, "confidence")?,
        rssi: parse_float(fields[RSSI], RSSI, "rssi")?,
        frequency_hz: parse_int(fields[FREQUENCY_HZ], FREQUENCY_HZ, "frequency_hz")?,
        arrangement: fields[ARRAY_ARRANGEMENT].trim().to_string(),
        station_id: fields[STATION_ID].trim().to_string(),
        latitude: parse_float(fields[LATITUDE], LATITUDE, "latitude")?,
        longitude,
    })
}

fn parse_float(value: &str, index: usize, name: &'static str) -> Result<f64, LineError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LineError::InvalidNumber {
            index,
            name,
            value: value.to_string(),
        })
}

/// Integers are sometimes written with a fractional part; truncate those.
fn parse_int(value: &str, index: usize, name: &'static str) -> Result<i64, LineError> {
    let trimmed = value.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Ok(v);
    }
    parse_float(trimmed, index, name).map(|v| v.trunc() as i64)
}

/// Wrap an angle into `[0, 360)`
pub fn normalize_angle(angle: f64) -> f64 {
    let value = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if value >= 360.0 {
        0.0
    } else {
        value
    }
}

/// Bring a raw angle into the system's rotational sense and apply the
/// operator's mount offset.
///
/// # Examples
///
/// ```
/// use kraken_proxy::ingest::record::correct_angle;
///
/// assert_eq!(correct_angle("UCA", 90.0, None), 270.0);
/// assert_eq!(correct_angle("UCA", 90.0, Some(100.0)), 10.0);
/// assert_eq!(correct_angle("ULA", 90.0, None), 90.0);
/// ```
pub fn correct_angle(arrangement: &str, raw_angle: f64, offset: Option<f64>) -> f64 {
    let angle = if arrangement == UCA_ARRANGEMENT {
        360.0 - raw_angle
    } else {
        raw_angle
    };

    // UCA 0 degrees would otherwise come out as 360
    normalize_angle(angle + offset.unwrap_or(0.0))
}

/// Round to `decimals` places; `-0.0` comes out as `0.0`
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor + 0.0
}

/// One normalized DOA measurement.
///
/// Equality and hashing cover every field, comparing floats by bit
/// pattern, so identical measurements collapse in a set.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub timestamp: i64,
    pub doa: f64,
    pub confidence: f64,
    pub rssi: f64,
    pub frequency_hz: i64,
    #[serde(rename = "ant_arrangement")]
    pub arrangement: String,
}

impl TelemetryRecord {
    /// Build a record from a parsed line
    ///
    /// # Arguments
    ///
    /// * `line` - Parsed measurement line
    /// * `timestamp` - Resolved timestamp (embedded or engine time)
    /// * `offset` - Operator mount offset in degrees, if set
    pub fn from_line(line: &DoaLine, timestamp: i64, offset: Option<f64>) -> Self {
        let doa = correct_angle(&line.arrangement, line.raw_angle, offset);
        Self {
            timestamp,
            // rounding can land on 360
            doa: normalize_angle(round_to(doa, 3)),
            confidence: round_to(line.confidence, 2),
            rssi: round_to(line.rssi, 2),
            frequency_hz: line.frequency_hz,
            arrangement: line.arrangement.clone(),
        }
    }

    fn key(&self) -> (i64, u64, u64, u64, i64, &str) {
        (
            self.timestamp,
            self.doa.to_bits(),
            self.confidence.to_bits(),
            self.rssi.to_bits(),
            self.frequency_hz,
            &self.arrangement,
        )
    }
}

impl PartialEq for TelemetryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TelemetryRecord {}

impl Hash for TelemetryRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
