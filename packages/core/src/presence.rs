//! Presence state machine.
//!
//! ```text
//! Idle --Arrived(match)--> Unlocking --ok--> Unlocked --Terminated--> Locking --> Idle
//!                              \--error--> Idle
//! ```
//!
//! The machine is driven by one consumer thread reading the watch channel, so
//! transitions never overlap. Events that arrive while the unlock workflow is
//! running wait in the channel and are handled once it finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::SshAgent;
use crate::config::{DaemonConfig, DeviceIdentity};
use crate::error::{Error, Result};
use crate::executor::ShellExecutor;
use crate::marker::MarkerStore;
use crate::registry::{CandidateVolume, VolumeRegistry};
use crate::watch::{DeviceEvent, TerminatedDevice};
use crate::workflow::{LockReport, UnlockReport, Workflow, WorkflowSettings};

/// Where the machine stands with respect to the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PresenceState {
    Idle,
    Unlocking,
    Unlocked,
    Locking,
}

/// Why an event caused no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Arrival while credentials are already loaded.
    AlreadyUnlocked,
    /// Arrival of a volume that is not the configured token.
    NotTheToken,
    /// Removal while nothing is unlocked.
    NotUnlocked,
    /// Removal of a different USB device.
    OtherDevice,
}

/// What handling an event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ignored(IgnoreReason),
    Unlocked(UnlockReport),
    /// Unlock failed; carries the error kind.
    UnlockAborted(&'static str),
    Locked(LockReport),
    /// Removal while unlocked but the marker was already gone.
    StaleRemoval,
}

/// Record of one handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PresenceState,
    pub to: PresenceState,
    pub event: DeviceEvent,
    pub outcome: Outcome,
}

/// How often [`PresenceMachine::run_until`] checks its stop flag.
const STOP_CHECK: Duration = Duration::from_millis(250);

pub struct PresenceMachine {
    identity: DeviceIdentity,
    state: PresenceState,
    registry: VolumeRegistry,
    workflow: Workflow,
}

impl PresenceMachine {
    /// Creates a machine in `Idle`.
    ///
    /// A marker left by a previous run is kept as is; the next unlock
    /// replaces it.
    pub fn new(identity: DeviceIdentity, workflow: Workflow) -> Self {
        let markers = workflow.markers();
        if marker_present(markers) {
            info!(
                marker = %markers.path().display(),
                "presence marker left from a previous run; starting idle"
            );
        }
        Self {
            identity,
            state: PresenceState::Idle,
            registry: VolumeRegistry::new(),
            workflow,
        }
    }

    /// Wires the production collaborators from configuration.
    pub fn from_config(config: &DaemonConfig, shell: Arc<dyn ShellExecutor>) -> Result<Self> {
        let state_dir = config.ensure_state_dir()?;
        let settings = WorkflowSettings::from_config(config)?;
        let agent = SshAgent::new(shell.clone(), settings.command_timeout);
        let workflow = Workflow::new(
            settings,
            shell,
            Box::new(agent),
            MarkerStore::in_state_dir(&state_dir),
        );
        Ok(Self::new(config.identity.clone(), workflow))
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    /// Runs the transition for one event.
    pub fn handle(&mut self, event: DeviceEvent) -> Transition {
        let from = self.state;
        let outcome = match &event {
            DeviceEvent::Arrived(volume) => self.on_arrival(volume),
            DeviceEvent::Terminated(device) => self.on_termination(device),
        };
        let to = self.state;

        match &outcome {
            Outcome::Ignored(reason) => {
                debug!(?from, ?reason, "event ignored");
            }
            outcome => {
                info!(?from, ?to, ?outcome, "presence transition");
            }
        }

        Transition {
            from,
            to,
            event,
            outcome,
        }
    }

    fn on_arrival(&mut self, volume: &CandidateVolume) -> Outcome {
        if self.state != PresenceState::Idle {
            return Outcome::Ignored(IgnoreReason::AlreadyUnlocked);
        }
        if !volume.device_descriptor_match(&self.identity) {
            debug!(volume = %volume.volume_name, descriptor = ?volume.descriptor, "not the token");
            return Outcome::Ignored(IgnoreReason::NotTheToken);
        }

        self.registry.record(volume.clone());
        let active = self.registry.activate(volume);

        info!(
            volume = %active.volume_name,
            mount = %active.mount_path.display(),
            "token inserted; unlocking"
        );
        self.state = PresenceState::Unlocking;
        let outcome = match self.workflow.unlock(&active) {
            Ok(report) => {
                self.state = PresenceState::Unlocked;
                if let Err(e) = self.workflow.eject_token(&active) {
                    warn!(kind = e.kind(), error = %e, "token not ejected");
                }
                Outcome::Unlocked(report)
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "unlock aborted");
                self.state = PresenceState::Idle;
                Outcome::UnlockAborted(e.kind())
            }
        };
        self.registry.finish();
        outcome
    }

    fn on_termination(&mut self, device: &TerminatedDevice) -> Outcome {
        if device.vendor_id != self.identity.vendor_id
            || device.product_id != self.identity.product_id
        {
            return Outcome::Ignored(IgnoreReason::OtherDevice);
        }
        if self.state != PresenceState::Unlocked {
            return Outcome::Ignored(IgnoreReason::NotUnlocked);
        }

        self.state = PresenceState::Locking;
        if !marker_present(self.workflow.markers()) {
            debug!(instance = %device.instance, "no presence marker; removal already handled");
            self.state = PresenceState::Idle;
            return Outcome::StaleRemoval;
        }

        info!(instance = %device.instance, "token removed; locking");
        let report = self.workflow.lock();
        self.state = PresenceState::Idle;
        Outcome::Locked(report)
    }

    /// Handles events until every sender is gone.
    pub fn run(&mut self, events: Receiver<DeviceEvent>) {
        for event in events {
            self.handle(event);
        }
        info!("event channel closed");
    }

    /// Handles events until `stop` is set or every sender is gone.
    pub fn run_until(&mut self, events: &Receiver<DeviceEvent>, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            match events.recv_timeout(STOP_CHECK) {
                Ok(event) => {
                    self.handle(event);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("event channel closed");
                    return;
                }
            }
        }
    }

    /// Handles whatever is queued right now without blocking.
    pub fn drain(&mut self, events: &Receiver<DeviceEvent>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => transitions.push(self.handle(event)),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return transitions,
            }
        }
    }
}

/// Whether the marker counts as present.
///
/// A file that exists but does not parse still counts. Any other read
/// failure counts as absent.
fn marker_present(markers: &MarkerStore) -> bool {
    match markers.read() {
        Ok(marker) => marker.is_some(),
        Err(Error::MarkerCorrupt { .. }) => true,
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "presence marker unreadable; treating as absent");
            false
        }
    }
}
