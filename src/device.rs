//! Devices and the device controller capability.
//!
//! This module defines what the orchestrator knows about devices: their
//! identifiers and platforms, and a small [`DeviceController`] capability for
//! app lifecycle management. The orchestrator never talks to a device
//! directly; everything goes through the controller or a
//! [`DeviceSession`](crate::session::DeviceSession).
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    DeviceController                       │
//! │                                                           │
//! │  list_connected() ──────────► Vec<Device>                 │
//! │  install(device, app)                                     │
//! │  launch(device, ProcessSpec)   (non-blocking)             │
//! │  terminate(device, bundle_id)  (pid lookup + signal)      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure Tolerance
//!
//! Controller calls are bounded by a timeout. Implementations treat timeouts
//! and tool failures during `install`, `launch` and `terminate` as tolerated
//! failures: they log a warning and return `Ok(())`, so a flaky device tool
//! degrades the run instead of aborting it.

pub mod command;
pub mod selector;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use command::CommandDeviceController;
pub use selector::DeviceSelector;

/// Reserved device identifier used for web-only plans.
pub const WEB_DEVICE_ID: &str = "chromium";

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while selecting or controlling devices.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// An explicitly requested device isn't connected.
    #[error("Device {0} was requested, but it is not connected")]
    NotConnected(String),

    /// No connected device matches the request.
    #[error("No devices connected{}", platform_suffix(.0))]
    NoDevices(Option<Platform>),

    /// The device tool failed or produced unusable output.
    #[error("Device tool failed: {0}")]
    ToolFailed(String),

    /// The device tool didn't answer in time.
    #[error("Device tool timed out: {0}")]
    Timeout(String),
}

fn platform_suffix(platform: &Option<Platform>) -> String {
    platform
        .map(|p| format!(" for platform {}", p))
        .unwrap_or_default()
}

/// The platform a device (or flow) targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Android emulators and devices.
    Android,
    /// iOS simulators and devices.
    Ios,
    /// Desktop browsers.
    Web,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Android => write!(f, "android"),
            Platform::Ios => write!(f, "ios"),
            Platform::Web => write!(f, "web"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "web" => Ok(Platform::Web),
            other => Err(format!("Unknown platform: {} (use android, ios or web)", other)),
        }
    }
}

/// A connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier (serial, UDID, ...).
    pub id: String,

    /// Platform of the device.
    pub platform: Platform,

    /// Human-readable description, e.g. `"Pixel 7 - API 34"`.
    #[serde(default)]
    pub description: String,
}

impl Device {
    /// Creates a device with an empty description.
    pub fn new(id: impl Into<String>, platform: Platform) -> Self {
        Self {
            id: id.into(),
            platform,
            description: String::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How to launch an app on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Bundle identifier / package name of the app.
    pub bundle_id: String,

    /// Launch arguments.
    pub args: Vec<String>,

    /// File that receives the launched process' output.
    pub log_path: PathBuf,
}

impl ProcessSpec {
    /// Creates a launch spec with no arguments.
    pub fn new(bundle_id: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            args: Vec::new(),
            log_path: log_path.into(),
        }
    }

    /// Adds a launch argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// App lifecycle management on concrete devices.
///
/// Implementations are expected to bound every call with a timeout and to
/// tolerate failures of `install`, `launch` and `terminate` (log and return
/// `Ok`). `list_connected` reports failures, since device selection can't
/// proceed without it.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Lists currently connected devices, in a stable order.
    async fn list_connected(&self) -> DeviceResult<Vec<Device>>;

    /// Installs the app at `app_path` on the device.
    async fn install(&self, device_id: &str, app_path: &Path) -> DeviceResult<()>;

    /// Launches an app without waiting for it to exit.
    async fn launch(&self, device_id: &str, spec: &ProcessSpec) -> DeviceResult<()>;

    /// Terminates a running app. An app that isn't running is not an error.
    async fn terminate(&self, device_id: &str, bundle_id: &str) -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_and_display() {
        assert_eq!("Android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!("ios".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!(Platform::Web.to_string(), "web");
        assert!("tizen".parse::<Platform>().is_err());
    }

    #[test]
    fn test_device_deserialize_without_description() {
        let device: Device =
            serde_json::from_str(r#"{"id": "emulator-5554", "platform": "android"}"#).unwrap();
        assert_eq!(device, Device::new("emulator-5554", Platform::Android));
    }

    #[test]
    fn test_no_devices_message() {
        assert_eq!(DeviceError::NoDevices(None).to_string(), "No devices connected");
        assert_eq!(
            DeviceError::NoDevices(Some(Platform::Ios)).to_string(),
            "No devices connected for platform ios"
        );
    }
}
