//! # Ingest Module
//!
//! Tails the receiver's measurement file and keeps a sliding time window of
//! live DOA records.
//!
//! This module handles:
//! - Polling the measurement file on a fixed interval
//! - Skipping unchanged files (modification time)
//! - Parsing and normalizing each line (see [`record`])
//! - Choosing the timestamp policy from the receiver version (see [`version`])
//! - De-duplicating records and evicting those older than the window
//! - Tracking sticky station fields (position, arrangement, alias)
//!
//! The poller is the only writer. Each tick builds a new [`CacheWindow`]
//! and swaps it in behind an `Arc`, so readers always see a whole window.

pub mod record;
pub mod version;

use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::IngestConfig;
use crate::error::Result;
use crate::settings::SettingsStore;
use record::{parse_line, TelemetryRecord};
use version::FormatVersion;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The published state of the cache
#[derive(Debug, Clone, Default)]
pub struct CacheWindow {
    pub records: HashSet<TelemetryRecord>,
    /// Engine time of the last insertion
    pub last_mutated_at: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub arrangement: Option<String>,
    pub alias: Option<String>,
}

/// Optional filters for [`IngestCache::read`]. Unset means "no filter".
#[derive(Debug, Clone, Default)]
pub struct CacheFilter {
    pub min_confidence: Option<f64>,
    pub min_rssi: Option<f64>,
    pub newer_than: Option<i64>,
}

impl CacheFilter {
    fn accepts(&self, record: &TelemetryRecord) -> bool {
        self.min_confidence.map_or(true, |min| record.confidence >= min)
            && self.min_rssi.map_or(true, |min| record.rssi >= min)
            && self.newer_than.map_or(true, |min| record.timestamp >= min)
    }
}

/// Snapshot returned to the HTTP layer
#[derive(Debug, Clone, Serialize)]
pub struct CacheView {
    #[serde(rename = "lat")]
    pub latitude: Option<f64>,
    #[serde(rename = "lon")]
    pub longitude: Option<f64>,
    #[serde(rename = "arr")]
    pub arrangement: Option<String>,
    pub alias: Option<String>,
    #[serde(rename = "freq")]
    pub frequency_hz: Option<i64>,
    #[serde(rename = "array_angle")]
    pub orientation_offset: Option<f64>,
    /// Newest first
    #[serde(rename = "data")]
    pub records: Vec<TelemetryRecord>,
}

/// Telemetry cache engine
#[derive(Debug)]
pub struct IngestCache {
    source: PathBuf,
    window_ms: i64,
    freshness_ms: i64,
    format_version: FormatVersion,
    /// Frequency fallback when the window is empty
    receiver_settings: Option<SettingsStore>,
    window: RwLock<Arc<CacheWindow>>,
    orientation_offset: RwLock<Option<f64>>,
    last_parsed_mtime: Mutex<Option<SystemTime>>,
}

impl IngestCache {
    /// Create an empty cache
    ///
    /// # Arguments
    ///
    /// * `source` - Measurement file written by the receiver
    /// * `config` - Window and freshness durations
    /// * `format_version` - Detected receiver version
    pub fn new(source: impl Into<PathBuf>, config: &IngestConfig, format_version: FormatVersion) -> Self {
        Self {
            source: source.into(),
            window_ms: config.window_ms,
            freshness_ms: config.freshness_ms,
            format_version,
            receiver_settings: None,
            window: RwLock::new(Arc::new(CacheWindow::default())),
            orientation_offset: RwLock::new(None),
            last_parsed_mtime: Mutex::new(None),
        }
    }

    /// Fall back to the receiver's configured frequency when no records are live
    pub fn with_receiver_settings(mut self, store: SettingsStore) -> Self {
        self.receiver_settings = Some(store);
        self
    }

    /// Start with a mount offset already set
    pub fn with_orientation_offset(self, offset: Option<f64>) -> Self {
        self.set_orientation_offset(offset);
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn format_version(&self) -> &FormatVersion {
        &self.format_version
    }

    /// Current mount offset in degrees
    pub fn orientation_offset(&self) -> Option<f64> {
        *self
            .orientation_offset
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the mount offset applied to newly parsed records.
    ///
    /// Records already in the window keep the offset they were parsed with.
    pub fn set_orientation_offset(&self, offset: Option<f64>) {
        info!("Array orientation offset set to {:?}", offset);
        *self
            .orientation_offset
            .write()
            .unwrap_or_else(PoisonError::into_inner) = offset;
    }

    /// The currently published window
    pub fn snapshot(&self) -> Arc<CacheWindow> {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, window: Arc<CacheWindow>) {
        *self.window.write().unwrap_or_else(PoisonError::into_inner) = window;
    }

    /// Run one poll cycle against the wall clock
    pub fn tick(&self) {
        self.tick_at(now_ms());
    }

    /// Run one poll cycle as of `now` (ms).
    ///
    /// Eviction always happens and is published first. Parsing failures are
    /// logged and leave the evicted window in place.
    pub fn tick_at(&self, now: i64) {
        let threshold = now - self.window_ms;
        let current = self.snapshot();
        debug!("Current app cache size: {}", current.records.len());

        let mut evicted = (*current).clone();
        // strict, so every record stays strictly younger than the window
        evicted.records.retain(|record| record.timestamp > threshold);
        debug!(
            "Reduced by time threshold {}, app cache size: {}",
            threshold,
            evicted.records.len()
        );
        let evicted = Arc::new(evicted);
        self.publish(evicted.clone());

        match self.ingest(&evicted, now, threshold) {
            Ok(Some(updated)) => self.publish(Arc::new(updated)),
            Ok(None) => {}
            Err(e) => error!("Failed to ingest {}: {}", self.source.display(), e),
        }
    }

    /// Parse the source into a new window, or `None` when there is nothing new
    fn ingest(&self, base: &CacheWindow, now: i64, threshold: i64) -> Result<Option<CacheWindow>> {
        if !self.source.exists() {
            debug!("File {} does not exist. Skipping...", self.source.display());
            return Ok(None);
        }

        let modified = fs::metadata(&self.source)?.modified()?;
        {
            let last = self
                .last_parsed_mtime
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(*last, Some(previous) if modified <= previous) {
                debug!("File {} has not changed. Skipping...", self.source.display());
                return Ok(None);
            }
        }

        debug!("Parsing {}...", self.source.display());
        let contents = fs::read_to_string(&self.source)?;

        let offset = self.orientation_offset();
        let mut window = base.clone();
        for line in contents.split('\n') {
            self.ingest_line(&mut window, line, now, threshold, offset);
        }

        *self
            .last_parsed_mtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(modified);
        Ok(Some(window))
    }

    fn ingest_line(
        &self,
        window: &mut CacheWindow,
        line: &str,
        now: i64,
        threshold: i64,
        offset: Option<f64>,
    ) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return;
        }

        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("DOA is of the wrong format ({}): {}", e, preview(line));
                return;
            }
        };

        let timestamp = if self.format_version.is_legacy() {
            now
        } else {
            match parsed.timestamp {
                Some(timestamp) => timestamp,
                None => {
                    debug!("Line has no usable timestamp: {}", preview(line));
                    return;
                }
            }
        };

        window.latitude = Some(parsed.latitude);
        if let Some(longitude) = parsed.longitude {
            window.longitude = Some(longitude);
        }
        window.arrangement = Some(parsed.arrangement.clone());
        if let Some(alias) = parsed.alias() {
            window.alias = Some(alias.to_string());
        }

        let record = TelemetryRecord::from_line(&parsed, timestamp, offset);
        if record.timestamp > threshold {
            debug!("Adding a line {:?} to cache", record);
            window.records.insert(record);
            window.last_mutated_at = Some(now);
        } else {
            debug!(
                "Line is outdated (time_threshold = {}, line ts = {}, delta = {}). Skipping...",
                threshold,
                record.timestamp,
                threshold - record.timestamp
            );
        }
    }

    /// Read the window with optional filters, newest record first
    pub fn read(&self, filter: &CacheFilter) -> CacheView {
        let window = self.snapshot();

        let mut records: Vec<TelemetryRecord> = window.records.iter().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let frequency_hz = match records.first() {
            Some(latest) => Some(latest.frequency_hz),
            None => self.configured_frequency(),
        };

        records.retain(|record| filter.accepts(record));

        CacheView {
            latitude: window.latitude,
            longitude: window.longitude,
            arrangement: window.arrangement.clone(),
            alias: window.alias.clone(),
            frequency_hz,
            orientation_offset: self.orientation_offset(),
            records,
        }
    }

    fn configured_frequency(&self) -> Option<i64> {
        let store = self.receiver_settings.as_ref()?;
        match store.load() {
            Ok(settings) => settings.center_freq_hz(),
            Err(e) => {
                debug!("No configured frequency available: {}", e);
                None
            }
        }
    }

    /// Whether data arrived recently and the source still exists
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(now_ms())
    }

    pub fn is_fresh_at(&self, now: i64) -> bool {
        let recent = self
            .snapshot()
            .last_mutated_at
            .map_or(false, |at| now - at < self.freshness_ms);
        recent && self.source.exists()
    }

    /// Milliseconds since the last insertion, `None` if nothing was ever inserted
    pub fn last_mutated_ago_ms(&self) -> Option<i64> {
        self.last_mutated_ago_ms_at(now_ms())
    }

    pub fn last_mutated_ago_ms_at(&self, now: i64) -> Option<i64> {
        self.snapshot().last_mutated_at.map(|at| now - at)
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(100) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Spawn the background task that ticks `cache` every `period`.
///
/// Each tick runs on the blocking pool; a panicking tick is logged and the
/// next one still runs.
pub fn spawn_poller(cache: Arc<IngestCache>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Cache updater started, polling {} every {:?}",
            cache.source().display(),
            period
        );

        loop {
            ticker.tick().await;
            let cache = cache.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || cache.tick()).await {
                error!("Cache tick failed: {}", e);
            }
        }
    })
}
