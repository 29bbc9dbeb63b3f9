//! # Receiver Format Version
//!
//! The receiver's software version decides how the embedded timestamp of a
//! measurement line is interpreted. The version is not published anywhere
//! machine-readable, so it is sniffed from the receiver's web UI sources.
//!
//! Detection order, first hit wins:
//!
//! 1. `KRAKEN_VERSION` environment variable
//! 2. `_UI/_web_interface/kraken_web_config.py` (`SOFTWARE_VERSION = "..."`)
//! 3. `_UI/_web_interface/kraken_web_interface.py` (`Software version ...` label)
//! 4. `_ui/_web_interface/variables.py` (`version = "..."`)
//! 5. [`FormatVersion::Unknown`]

use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable that short-circuits detection
pub const VERSION_ENV: &str = "KRAKEN_VERSION";

/// Release whose embedded timestamps are unreliable
const LEGACY_COMPONENTS: [u64; 2] = [1, 6];

struct VersionProbe {
    relative_path: &'static str,
    pattern: &'static str,
}

const PROBES: [VersionProbe; 3] = [
    VersionProbe {
        relative_path: "_UI/_web_interface/kraken_web_config.py",
        pattern: r#"(?mi)^\s*software_version\s*=\s*["']v?(\d+(?:\.\d+)*)["']"#,
    },
    VersionProbe {
        relative_path: "_UI/_web_interface/kraken_web_interface.py",
        pattern: r#"(?i)software\s+version\s*:?\s*v?(\d+(?:\.\d+)+)"#,
    },
    VersionProbe {
        relative_path: "_ui/_web_interface/variables.py",
        pattern: r#"(?mi)^\s*version\s*=\s*["']v?(\d+(?:\.\d+)*)["']"#,
    },
];

/// Measurement format, as far as the cache engine cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatVersion {
    /// Embedded timestamps must be replaced with the local clock
    Legacy,
    /// Any other detected release; embedded timestamps are trusted
    Other(String),
    /// Detection failed; embedded timestamps are trusted
    Unknown,
}

impl FormatVersion {
    /// Classify a version string such as `1.6`, `v1.6.0` or `1.7.1`
    ///
    /// # Examples
    ///
    /// ```
    /// use kraken_proxy::ingest::version::FormatVersion;
    ///
    /// assert_eq!(FormatVersion::from_version_str("v1.6.0"), FormatVersion::Legacy);
    /// assert!(!FormatVersion::from_version_str("1.7").is_legacy());
    /// ```
    pub fn from_version_str(version: &str) -> Self {
        let trimmed = version.trim();
        if trimmed.is_empty() {
            return FormatVersion::Unknown;
        }

        let numeric = trimmed.trim_start_matches(['v', 'V']);
        let components: Option<Vec<u64>> =
            numeric.split('.').map(|part| part.parse().ok()).collect();

        match components {
            Some(mut components) => {
                while components.len() > 1 && components.last() == Some(&0) {
                    components.pop();
                }
                if components == LEGACY_COMPONENTS {
                    FormatVersion::Legacy
                } else {
                    FormatVersion::Other(numeric.to_string())
                }
            }
            None => FormatVersion::Other(trimmed.to_string()),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, FormatVersion::Legacy)
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatVersion::Legacy => write!(f, "1.6"),
            FormatVersion::Other(version) => write!(f, "{}", version),
            FormatVersion::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detect the receiver's format version under `doa_root`
pub fn detect(doa_root: &Path) -> FormatVersion {
    detect_with(doa_root, std::env::var(VERSION_ENV).ok())
}

fn detect_with(doa_root: &Path, env_override: Option<String>) -> FormatVersion {
    if let Some(version) = env_override.filter(|v| !v.trim().is_empty()) {
        info!("Receiver version {} taken from {}", version, VERSION_ENV);
        return FormatVersion::from_version_str(&version);
    }

    for probe in &PROBES {
        let path = doa_root.join(probe.relative_path);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                debug!("Version probe {} unavailable: {}", path.display(), e);
                continue;
            }
        };

        let regex = match Regex::new(probe.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!("Invalid version pattern for {}: {}", probe.relative_path, e);
                continue;
            }
        };

        if let Some(found) = regex.captures(&source).and_then(|c| c.get(1)) {
            info!("Receiver version {} found in {}", found.as_str(), path.display());
            return FormatVersion::from_version_str(found.as_str());
        }
        debug!("No version string in {}", path.display());
    }

    warn!("Could not detect receiver version under {}", doa_root.display());
    FormatVersion::Unknown
}
