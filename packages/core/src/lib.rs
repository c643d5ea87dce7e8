//! usbkey-core: Core library for the usbkey presence daemon.
//!
//! Plugging in a specific USB token decrypts a container stored on it and
//! leases the SSH keys inside to the running agent. Pulling the token out
//! purges the agent and locks the session.
//!
//! # Modules
//!
//! - [`watch`]: Device watch channel feeding normalized events
//! - [`linux`]: udev notification backend
//! - [`presence`]: The presence state machine
//! - [`workflow`]: Unlock and lock side effects
//! - [`registry`]: Candidate volume bookkeeping
//! - [`marker`]: Persistent presence marker
//! - [`agent`]: `ssh-agent` bridge
//! - [`executor`]: External command execution with timeouts
//! - [`tools`]: Per-OS command templates and notifications
//! - [`disk`]: Block device scanning (`lsblk`)
//! - [`probe`]: Filesystem probes
//! - [`config`]: Daemon configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(target_os = "linux")] {
//! use std::sync::Arc;
//! use std::sync::mpsc;
//! use usbkey_core::{DaemonConfig, PresenceMachine, SystemShell, UdevSource, WatchSession};
//!
//! let config = DaemonConfig::load(None).unwrap();
//! let shell = Arc::new(SystemShell::with_default_timeout(config.command_timeout()));
//! let mut machine = PresenceMachine::from_config(&config, shell).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let mut source = UdevSource::new(config.mount_recheck());
//! let _session = WatchSession::open(&config.identity, &mut source, tx).unwrap();
//! machine.run(rx);
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod disk;
pub mod error;
pub mod executor;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod marker;
pub mod presence;
pub mod probe;
pub mod registry;
pub mod tools;
pub mod watch;
pub mod workflow;

pub use agent::{SecretAgent, SshAgent};
pub use config::{DaemonConfig, DeviceIdentity};
pub use error::{Error, Result};
pub use executor::{CommandOutput, CommandSpec, ShellExecutor, SystemShell};
#[cfg(target_os = "linux")]
pub use linux::UdevSource;
pub use marker::MarkerStore;
pub use presence::{Outcome, PresenceMachine, PresenceState, Transition};
pub use registry::{CandidateVolume, DiskDescriptor, VolumeRegistry};
pub use tools::{CommandTemplate, Notifier, ToolCommands};
pub use watch::{DeviceEvent, NotificationSource, Subscription, TerminatedDevice, WatchSession};
pub use workflow::{Workflow, WorkflowSettings};
