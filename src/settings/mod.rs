//! # Settings Module
//!
//! Read-modify-write access to the JSON settings documents shared with the
//! receiver.
//!
//! A [`SettingsStore`] always loads the whole document, merges the provided
//! keys and writes the whole document back. Keys this crate does not know
//! about are preserved. There is no locking: concurrent writers race and the
//! last one wins.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;

/// Number of VFO channels the receiver exposes
pub const VFO_COUNT: usize = 16;

/// `location_source` value written together with manual coordinates
pub const LOCATION_SOURCE_STATIC: &str = "Static";

/// Typed view of the keys this crate reads.
///
/// Every field is optional because the document is owned by another
/// program and may not carry them. Everything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSettings {
    /// Center frequency in MHz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_freq: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,

    /// Array mount offset in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_angle: Option<f64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReceiverSettings {
    /// Center frequency converted to Hz
    pub fn center_freq_hz(&self) -> Option<i64> {
        self.center_freq.map(|mhz| (mhz * 1_000_000.0).round() as i64)
    }
}

/// A partial update. Only fields that are set get written.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_freq: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_angle: Option<f64>,

    /// `vfo_freq_<n>` keys, in Hz
    #[serde(flatten)]
    pub vfo: BTreeMap<String, i64>,
}

impl SettingsPatch {
    /// Patch that retunes the receiver.
    ///
    /// The center frequency and all VFO frequencies always change together.
    pub fn frequency(frequency_hz: i64) -> Self {
        let vfo = (0..VFO_COUNT)
            .map(|i| (format!("vfo_freq_{}", i), frequency_hz))
            .collect();

        Self {
            center_freq: Some(frequency_hz as f64 / 1_000_000.0),
            vfo,
            ..Self::default()
        }
    }

    /// Patch that pins the station to fixed coordinates
    pub fn coordinates(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            location_source: Some(LOCATION_SOURCE_STATIC.to_string()),
            ..Self::default()
        }
    }

    pub fn station_id(station_id: &str) -> Self {
        Self {
            station_id: Some(station_id.to_string()),
            ..Self::default()
        }
    }

    pub fn array_angle(angle: f64) -> Self {
        Self {
            array_angle: Some(angle),
            ..Self::default()
        }
    }
}

/// A JSON settings document on disk
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    /// Treat a missing file as an empty document
    optional: bool,
}

impl SettingsStore {
    /// Store for a document that must already exist (the receiver's own)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            optional: false,
        }
    }

    /// Store for a document this crate owns; created on first write
    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            optional: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the raw document
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read (or is missing for a
    /// required store) or is not a JSON object.
    pub fn load_document(&self) -> Result<Map<String, Value>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound && self.optional => {
                debug!("Settings file {} does not exist yet", self.path.display());
                return Ok(Map::new());
            }
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() && self.optional {
            return Ok(Map::new());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Load the typed view of the document
    pub fn load(&self) -> Result<ReceiverSettings> {
        let document = self.load_document()?;
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    /// Merge `patch` into the document and persist it.
    ///
    /// The file is written to a sibling temporary file and renamed over the
    /// original, so readers never see a half-written document.
    pub fn update(&self, patch: &SettingsPatch) -> Result<()> {
        let mut document = self.load_document()?;

        if let Value::Object(changes) = serde_json::to_value(patch)? {
            debug!(
                "Updating {} keys in {}",
                changes.len(),
                self.path.display()
            );
            for (key, value) in changes {
                document.insert(key, value);
            }
        }

        let serialized = serde_json::to_string_pretty(&Value::Object(document))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Copy the document into `backup_dir` with a timestamped name
    ///
    /// # Returns
    ///
    /// * `Result<PathBuf>` - Path of the backup copy
    pub fn backup(&self, backup_dir: &Path, now: DateTime<Local>) -> Result<PathBuf> {
        fs::create_dir_all(backup_dir)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings.json".to_string());
        let destination =
            backup_dir.join(format!("{}-{}.bak", now.format("%Y%m%d-%H%M%S"), file_name));

        fs::copy(&self.path, &destination)?;
        info!("Backed up {} to {}", self.path.display(), destination.display());
        Ok(destination)
    }
}
