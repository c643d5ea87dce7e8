//! Daemon configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults for a SanDisk Cruzer Fit token on the host platform.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info};

use crate::error::{ConfigParseSnafu, Error, IoResultExt, Result};
use crate::probe;
use crate::tools::ToolCommands;

/// USB vendor ID of SanDisk.
pub const SANDISK_VENDOR_ID: u16 = 0x0781;

/// USB product ID of the SanDisk Cruzer Fit.
pub const CRUZER_FIT_PRODUCT_ID: u16 = 0x5571;

/// Default credential lease in seconds.
pub const DEFAULT_LEASE_SECS: u64 = 7200;

/// Directory name used under the platform config/data directories.
pub const APP_DIR_NAME: &str = "usbkey";

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Name of the key file inside the state directory.
pub const KEY_FILE_NAME: &str = "key";

/// The one hardware token this daemon recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Vendor string as reported by the disk layer, e.g. "SanDisk".
    pub vendor_label: String,
    /// Model string as reported by the disk layer, e.g. "Cruzer Fit".
    pub product_label: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_id: SANDISK_VENDOR_ID,
            product_id: CRUZER_FIT_PRODUCT_ID,
            vendor_label: "SanDisk".to_string(),
            product_label: "Cruzer Fit".to_string(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub identity: DeviceIdentity,
    /// Private state directory holding the key file and the marker.
    pub state_dir: Option<PathBuf>,
    /// Key file fed to the decrypt tool. Defaults to `<state_dir>/key`.
    pub key_file: Option<PathBuf>,
    /// Optional lowercase hex SHA-256 the key file must match.
    pub key_sha256: Option<String>,
    /// Container image path relative to the token's mount point.
    pub container_image: String,
    /// Where the decrypt tool mounts the container.
    pub container_mount: Option<PathBuf>,
    /// Lifetime of credentials added to the agent.
    pub lease_secs: u64,
    /// Deadline for eject, agent and lock commands.
    pub command_timeout_secs: u64,
    /// Deadline for the decrypt tool.
    pub decrypt_timeout_secs: u64,
    /// How often a token partition that udev reported unmounted is looked up
    /// again.
    pub mount_recheck_ms: u64,
    /// Whether to show desktop notifications.
    pub notifications: bool,
    pub tools: ToolCommands,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            state_dir: None,
            key_file: None,
            key_sha256: None,
            container_image: default_container_image().to_string(),
            container_mount: None,
            lease_secs: DEFAULT_LEASE_SECS,
            command_timeout_secs: 30,
            decrypt_timeout_secs: 120,
            mount_recheck_ms: 500,
            notifications: true,
            tools: ToolCommands::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.is_file() => Self::from_file(&default)?,
                Some(default) => {
                    debug!(path = %default.display(), "no config file; using defaults");
                    Self::default()
                }
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).config_read_context(path)?;
        let config: Self = serde_json::from_str(&raw).context(ConfigParseSnafu { path })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Rejects values that would make the daemon misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if let Some(pin) = &self.key_sha256 {
            let valid = pin.len() == 64 && pin.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                snafu::whatever!("key_sha256 must be 64 hex characters");
            }
        }
        if self.container_image.trim().is_empty() {
            snafu::whatever!("container_image must not be empty");
        }
        if self.lease_secs == 0 {
            snafu::whatever!("lease_secs must be greater than zero");
        }
        Ok(())
    }

    /// The private state directory.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_state_dir(),
        }
    }

    /// Creates the state directory if it does not exist yet.
    pub fn ensure_state_dir(&self) -> Result<PathBuf> {
        let dir = self.state_dir()?;
        if !probe::is_dir(&dir) {
            fs::create_dir_all(&dir).state_dir_context(&dir)?;
            info!(path = %dir.display(), "created state directory");
        }
        Ok(dir)
    }

    /// Path of the key file.
    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(path.clone()),
            None => Ok(self.state_dir()?.join(KEY_FILE_NAME)),
        }
    }

    /// Mount point of the decrypted container.
    pub fn container_mount(&self) -> Result<PathBuf> {
        match &self.container_mount {
            Some(path) => Ok(path.clone()),
            None => default_container_mount(),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn decrypt_timeout(&self) -> Duration {
        Duration::from_secs(self.decrypt_timeout_secs)
    }

    pub fn mount_recheck(&self) -> Duration {
        Duration::from_millis(self.mount_recheck_ms.max(50))
    }
}

/// `<config_dir>/usbkey/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// `~/Library/usbkey` on macOS, `<data_local_dir>/usbkey` elsewhere.
pub fn default_state_dir() -> Result<PathBuf> {
    if cfg!(target_os = "macos") {
        let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
        return Ok(home.join("Library").join(APP_DIR_NAME));
    }
    let base = dirs::data_local_dir().ok_or(Error::HomeDirNotFound)?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_container_mount() -> Result<PathBuf> {
    if cfg!(target_os = "macos") {
        return Ok(PathBuf::from("/Volumes/usbkey"));
    }
    match dirs::runtime_dir() {
        Some(dir) => Ok(dir.join(APP_DIR_NAME)),
        None => Ok(default_state_dir()?.join("mnt")),
    }
}

fn default_container_image() -> &'static str {
    if cfg!(target_os = "macos") {
        "osx.sparseimage"
    } else {
        "usbkey.crypt"
    }
}
