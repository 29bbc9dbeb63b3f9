//! GPIO relay that switches power to the receiver

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::config::PowerConfig;

/// Legacy sysfs GPIO root
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// How long to wait for the kernel to create a freshly exported pin
const EXPORT_WAIT_ATTEMPTS: u32 = 20;
const EXPORT_WAIT_STEP: Duration = Duration::from_millis(10);

/// Logical relay position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLevel {
    On,
    Off,
}

/// Trait for driving the power relay
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PowerRelay: Send + Sync {
    async fn set_level(&self, level: RelayLevel) -> io::Result<()>;
}

/// Relay on a sysfs-exported GPIO line (BCM numbering)
#[derive(Debug, Clone)]
pub struct SysfsGpioRelay {
    pin: u32,
    active_high: bool,
    root: PathBuf,
}

impl SysfsGpioRelay {
    pub fn new(pin: u32, active_high: bool) -> Self {
        Self::with_root(pin, active_high, SYSFS_GPIO_ROOT)
    }

    pub fn from_config(config: &PowerConfig) -> Self {
        Self::new(config.relay_pin, config.relay_active_high)
    }

    /// Use a different sysfs root (tests, remapped chips)
    pub fn with_root(pin: u32, active_high: bool, root: impl Into<PathBuf>) -> Self {
        Self {
            pin,
            active_high,
            root: root.into(),
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    /// Electrical value for a logical level
    fn value_for(&self, level: RelayLevel) -> &'static str {
        match (level, self.active_high) {
            (RelayLevel::On, true) | (RelayLevel::Off, false) => "1",
            (RelayLevel::Off, true) | (RelayLevel::On, false) => "0",
        }
    }

    async fn ensure_exported(&self) -> io::Result<PathBuf> {
        let pin_dir = self.pin_dir();
        if pin_dir.exists() {
            return Ok(pin_dir);
        }

        debug!("Exporting GPIO {}", self.pin);
        tokio::fs::write(self.root.join("export"), self.pin.to_string()).await?;
        wait_for_dir(&pin_dir).await?;
        Ok(pin_dir)
    }
}

async fn wait_for_dir(dir: &Path) -> io::Result<()> {
    for _ in 0..EXPORT_WAIT_ATTEMPTS {
        if dir.exists() {
            return Ok(());
        }
        sleep(EXPORT_WAIT_STEP).await;
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} did not appear after export", dir.display()),
    ))
}

#[async_trait]
impl PowerRelay for SysfsGpioRelay {
    async fn set_level(&self, level: RelayLevel) -> io::Result<()> {
        let pin_dir = self.ensure_exported().await?;
        tokio::fs::write(pin_dir.join("direction"), "out").await?;
        tokio::fs::write(pin_dir.join("value"), self.value_for(level)).await?;
        info!("Relay on GPIO {} set {:?}", self.pin, level);
        Ok(())
    }
}
