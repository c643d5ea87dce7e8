//! Unified error types for the usbkey-core library.
//!
//! Uses SNAFU for context-rich error handling. The same underlying
//! `std::io::Error` shows up in very different places (marker file, key file,
//! spawning `ssh-add`), and the context selectors keep those apart.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn or talk to a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Command did not finish within its deadline and was terminated.
    #[snafu(display("command '{command}' timed out after {secs}s"))]
    CommandTimeout { command: String, secs: u64 },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// A udev monitor or enumeration could not be set up.
    #[snafu(display("udev {subsystem} monitor failed"))]
    DeviceMonitor {
        subsystem: String,
        source: std::io::Error,
    },

    /// One of the notification channels could not be registered.
    #[snafu(display("failed to subscribe to {channel} notifications: {message}"))]
    SubscriptionFailed { channel: String, message: String },

    /// Key material is not present at the configured path.
    #[snafu(display("key file not found at {}", path.display()))]
    KeyMissing { path: PathBuf },

    /// Key material exists but does not match the pinned digest.
    #[snafu(display("key file at {} does not match pinned digest", path.display()))]
    KeyMismatch { path: PathBuf },

    /// Reading the key file failed for a reason other than absence.
    #[snafu(display("failed to read key file at {}", path.display()))]
    KeyRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The decrypt tool failed or timed out.
    #[snafu(display("failed to decrypt container {}: {message}", image.display()))]
    DecryptFailed { image: PathBuf, message: String },

    /// The decrypted container did not show up where expected.
    #[snafu(display("decrypted container not mounted at {}", path.display()))]
    MountNotFound { path: PathBuf },

    /// Ejecting the decrypted container or the token failed.
    #[snafu(display("failed to eject {target}: {message}"))]
    Eject { target: String, message: String },

    /// Marker file could not be read, written or removed.
    #[snafu(display("marker file I/O failed at {}", path.display()))]
    MarkerIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Marker file exists but its contents are not a valid marker.
    #[snafu(display("marker file at {} is corrupt: {message}", path.display()))]
    MarkerCorrupt { path: PathBuf, message: String },

    /// The secret agent refused an add or purge request.
    #[snafu(display("secret agent {operation} failed: {message}"))]
    CredentialBridge { operation: String, message: String },

    /// Failed to lock the interactive session.
    #[snafu(display("failed to lock session: {message}"))]
    SessionLock { message: String },

    /// Failed to read the configuration file.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON or has wrong types.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Failed to create the private state directory.
    #[snafu(display("failed to create state directory at {}", path.display()))]
    StateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Home or data directory could not be determined.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Short stable name of the failure, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CommandExecution { .. } => "command_execution",
            Error::CommandExit { .. } => "command_exit",
            Error::CommandTimeout { .. } => "command_timeout",
            Error::LsblkParse { .. } => "lsblk_parse",
            Error::DeviceMonitor { .. } => "device_monitor",
            Error::SubscriptionFailed { .. } => "subscription_failed",
            Error::KeyMissing { .. } => "key_missing",
            Error::KeyMismatch { .. } => "key_mismatch",
            Error::KeyRead { .. } => "key_read",
            Error::DecryptFailed { .. } => "decrypt_failed",
            Error::MountNotFound { .. } => "mount_not_found",
            Error::Eject { .. } => "eject",
            Error::MarkerIo { .. } => "marker_io",
            Error::MarkerCorrupt { .. } => "marker_corrupt",
            Error::CredentialBridge { .. } => "credential_bridge",
            Error::SessionLock { .. } => "session_lock",
            Error::ConfigRead { .. } => "config_read",
            Error::ConfigParse { .. } => "config_parse",
            Error::StateDir { .. } => "state_dir",
            Error::HomeDirNotFound => "home_dir_not_found",
            Error::Generic { .. } => "generic",
        }
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for marker file errors.
    fn marker_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for key file read errors.
    fn key_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for state directory creation errors.
    fn state_dir_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn marker_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MarkerIoSnafu { path: path.into() })
    }

    fn key_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(KeyReadSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn state_dir_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateDirSnafu { path: path.into() })
    }
}
