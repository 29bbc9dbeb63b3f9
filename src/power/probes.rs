//! Trait abstraction for device and OS-service queries to enable testing

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PowerConfig;

/// Default CPU thermal zone (millidegrees Celsius)
pub const DEFAULT_THERMAL_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// What the service manager reports for the receiver service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Inactive,
    /// Transitional state or the query itself failed
    Unknown,
}

impl ServiceStatus {
    /// Interpret `systemctl is-active` output
    pub fn from_systemctl(output: &str) -> Self {
        match output.trim() {
            "active" | "reloading" => ServiceStatus::Active,
            "inactive" | "failed" => ServiceStatus::Inactive,
            _ => ServiceStatus::Unknown,
        }
    }
}

/// Queries and commands against the receiver hardware and its OS service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceProbes: Send + Sync {
    /// Whether the SDR shows up on the USB bus
    async fn is_device_enumerated(&self) -> bool;

    async fn service_status(&self) -> ServiceStatus;

    /// Ask the service manager to start the service; does not wait
    async fn start_service(&self) -> io::Result<()>;

    /// Ask the service manager to stop the service; does not wait
    async fn stop_service(&self) -> io::Result<()>;

    /// CPU temperature in whole degrees Celsius
    async fn read_temperature(&self) -> Option<i32>;

    async fn reboot(&self) -> io::Result<()>;
}

/// Probes backed by `lsusb`, `systemctl` and sysfs
#[derive(Debug, Clone)]
pub struct SystemProbes {
    usb_id: String,
    service_name: String,
    thermal_path: PathBuf,
}

impl SystemProbes {
    pub fn new(usb_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            usb_id: usb_id.into(),
            service_name: service_name.into(),
            thermal_path: PathBuf::from(DEFAULT_THERMAL_PATH),
        }
    }

    pub fn from_config(config: &PowerConfig) -> Self {
        Self::new(config.usb_id.clone(), config.service_name.clone())
    }

    pub fn with_thermal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.thermal_path = path.into();
        self
    }

    async fn run(program: &str, args: &[&str]) -> io::Result<Output> {
        debug!("Running {} {}", program, args.join(" "));
        Command::new(program).args(args).output().await
    }

    async fn run_checked(program: &str, args: &[&str]) -> io::Result<()> {
        let output = Self::run(program, args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} {} exited with {}: {}",
                    program,
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

/// Parse a sysfs thermal reading (millidegrees) into whole degrees
pub fn parse_millidegrees(raw: &str) -> Option<i32> {
    raw.trim().parse::<i64>().ok().map(|milli| (milli / 1000) as i32)
}

#[async_trait]
impl DeviceProbes for SystemProbes {
    async fn is_device_enumerated(&self) -> bool {
        match Self::run("lsusb", &["-d", &self.usb_id]).await {
            Ok(output) => output.status.success() && !output.stdout.is_empty(),
            Err(e) => {
                warn!("lsusb failed: {}", e);
                false
            }
        }
    }

    async fn service_status(&self) -> ServiceStatus {
        // is-active exits non-zero for anything but "active"; the text is what matters
        match Self::run("systemctl", &["is-active", &self.service_name]).await {
            Ok(output) => ServiceStatus::from_systemctl(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("systemctl is-active {} failed: {}", self.service_name, e);
                ServiceStatus::Unknown
            }
        }
    }

    async fn start_service(&self) -> io::Result<()> {
        Self::run_checked("systemctl", &["start", "--no-block", &self.service_name]).await
    }

    async fn stop_service(&self) -> io::Result<()> {
        Self::run_checked("systemctl", &["stop", "--no-block", &self.service_name]).await
    }

    async fn read_temperature(&self) -> Option<i32> {
        match tokio::fs::read_to_string(&self.thermal_path).await {
            Ok(raw) => parse_millidegrees(&raw),
            Err(e) => {
                debug!("No CPU temperature at {}: {}", self.thermal_path.display(), e);
                None
            }
        }
    }

    async fn reboot(&self) -> io::Result<()> {
        Self::run_checked("systemctl", &["reboot"]).await
    }
}
