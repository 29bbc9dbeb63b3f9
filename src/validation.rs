//! # Request Validation
//!
//! Range checks applied at the HTTP boundary before anything is written to
//! the settings documents.

use crate::error::{ProxyError, Result};

/// Lowest tunable frequency (24 MHz)
pub const MIN_FREQUENCY_HZ: i64 = 24_000_000;

/// Highest tunable frequency (1766 MHz)
pub const MAX_FREQUENCY_HZ: i64 = 1_766_000_000;

/// Longest station id the receiver accepts
pub const MAX_STATION_ID_LEN: usize = 10;

/// Check that a frequency is within the receiver's tuning range.
///
/// Both bounds are inclusive.
///
/// # Examples
///
/// ```
/// use kraken_proxy::validation::validate_frequency;
///
/// assert!(validate_frequency(433_000_000).is_ok());
/// assert!(validate_frequency(10_000_000).is_err());
/// ```
pub fn validate_frequency(frequency_hz: i64) -> Result<i64> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&frequency_hz) {
        return Err(ProxyError::Validation(format!(
            "frequency_hz must be between {} and {}, got {}",
            MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ, frequency_hz
        )));
    }
    Ok(frequency_hz)
}

/// Check that an array angle lies in `[0, 360]`.
pub fn validate_angle(angle: f64) -> Result<f64> {
    if !(0.0..=360.0).contains(&angle) {
        return Err(ProxyError::Validation(format!(
            "array_angle must be between 0 and 360, got {}",
            angle
        )));
    }
    Ok(angle)
}

/// Check station coordinates in decimal degrees.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(f64, f64)> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(ProxyError::Validation(format!(
            "lat must be between -90 and 90, got {}",
            latitude
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(ProxyError::Validation(format!(
            "lon must be between -180 and 180, got {}",
            longitude
        )));
    }
    Ok((latitude, longitude))
}

/// Check a station id (call sign): 1 to 10 characters of `[A-Za-z0-9-]`.
pub fn validate_station_id(station_id: &str) -> Result<&str> {
    let valid_chars = station_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-');

    if station_id.is_empty() || station_id.len() > MAX_STATION_ID_LEN || !valid_chars {
        return Err(ProxyError::Validation(format!(
            "station_id must be 1-{} characters of letters, digits or '-', got '{}'",
            MAX_STATION_ID_LEN, station_id
        )));
    }
    Ok(station_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_bounds_inclusive() {
        assert!(validate_frequency(24_000_000).is_ok());
        assert!(validate_frequency(1_766_000_000).is_ok());
    }

    #[test]
    fn test_frequency_outside_bounds() {
        assert!(validate_frequency(23_999_999).is_err());
        assert!(validate_frequency(1_766_000_001).is_err());
        assert!(validate_frequency(0).is_err());
        assert!(validate_frequency(-433_000_000).is_err());
    }

    #[test]
    fn test_frequency_error_message() {
        match validate_frequency(1) {
            Err(ProxyError::Validation(msg)) => assert!(msg.contains("frequency_hz")),
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[test]
    fn test_angle_bounds() {
        assert!(validate_angle(0.0).is_ok());
        assert!(validate_angle(360.0).is_ok());
        assert!(validate_angle(-0.1).is_err());
        assert!(validate_angle(360.1).is_err());
        assert!(validate_angle(f64::NAN).is_err());
    }

    #[test]
    fn test_coordinates() {
        assert!(validate_coordinates(60.17, 24.94).is_ok());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());
        assert!(validate_coordinates(90.5, 0.0).is_err());
        assert!(validate_coordinates(0.0, -180.5).is_err());
    }

    #[test]
    fn test_station_id() {
        assert!(validate_station_id("OH2-KRK").is_ok());
        assert!(validate_station_id("").is_err());
        assert!(validate_station_id("WAY-TOO-LONG-ID").is_err());
        assert!(validate_station_id("bad id").is_err());
    }
}
