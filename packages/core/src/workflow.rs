//! Side effects of inserting and removing the token.
//!
//! The state machine decides *when* to unlock or lock; [`Workflow`] knows
//! *how*: feeding the key to the decrypt tool, leasing keys to the agent,
//! ejecting, writing the marker, locking the session.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::agent::SecretAgent;
use crate::config::DaemonConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{CommandSpec, ShellExecutor};
use crate::marker::MarkerStore;
use crate::probe;
use crate::registry::CandidateVolume;
use crate::tools::{
    CommandTemplate, Notifier, ToolCommands, VAR_DEVICE, VAR_DISK, VAR_IMAGE, VAR_MOUNT,
    VAR_VOLUME,
};

/// Knobs of the unlock and lock workflows.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub key_path: PathBuf,
    /// Lowercase hex SHA-256 the key must match, if pinned.
    pub key_sha256: Option<String>,
    /// Image path relative to the token's mount point.
    pub container_image: String,
    pub container_mount: PathBuf,
    pub lease: Duration,
    pub command_timeout: Duration,
    pub decrypt_timeout: Duration,
    pub tools: ToolCommands,
    pub notifications: bool,
}

impl WorkflowSettings {
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        Ok(Self {
            key_path: config.key_path()?,
            key_sha256: config.key_sha256.as_ref().map(|p| p.to_ascii_lowercase()),
            container_image: config.container_image.clone(),
            container_mount: config.container_mount()?,
            lease: config.lease(),
            command_timeout: config.command_timeout(),
            decrypt_timeout: config.decrypt_timeout(),
            tools: config.tools.clone(),
            notifications: config.notifications,
        })
    }
}

/// Outcome of a completed unlock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlockReport {
    /// Credentials the agent accepted.
    pub leased: usize,
    /// Entries the agent rejected.
    pub rejected: usize,
}

/// Outcome of a lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockReport {
    pub marker_removed: bool,
    pub purged: bool,
    pub session_locked: bool,
}

/// How far an unlock got before failing.
#[derive(Debug, Default)]
struct Progress {
    decrypted: bool,
    leased: usize,
}

/// Placeholder values for one token volume.
struct ToolVars {
    volume: String,
    image: String,
    mount: String,
    device: String,
    disk: String,
}

impl ToolVars {
    fn render(&self, template: &CommandTemplate) -> CommandSpec {
        template.render(&[
            (VAR_VOLUME, self.volume.as_str()),
            (VAR_IMAGE, self.image.as_str()),
            (VAR_MOUNT, self.mount.as_str()),
            (VAR_DEVICE, self.device.as_str()),
            (VAR_DISK, self.disk.as_str()),
        ])
    }
}

/// Performs the insert and remove side effects.
pub struct Workflow {
    settings: WorkflowSettings,
    shell: Arc<dyn ShellExecutor>,
    agent: Box<dyn SecretAgent>,
    markers: MarkerStore,
    notifier: Notifier,
}

impl Workflow {
    pub fn new(
        settings: WorkflowSettings,
        shell: Arc<dyn ShellExecutor>,
        agent: Box<dyn SecretAgent>,
        markers: MarkerStore,
    ) -> Self {
        let notifier = Notifier::new(
            shell.clone(),
            settings.tools.notify.clone(),
            settings.notifications,
            settings.command_timeout,
        );
        Self {
            settings,
            shell,
            agent,
            markers,
            notifier,
        }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Decrypts the container on `volume`, leases its keys and writes the
    /// marker.
    ///
    /// On error, any credentials already leased are purged, the container is
    /// detached if it was attached, and the token is force-ejected. No marker
    /// is left behind.
    pub fn unlock(&mut self, volume: &CandidateVolume) -> Result<UnlockReport> {
        let vars = self.vars(volume);
        let mut progress = Progress::default();
        match self.try_unlock(&vars, &mut progress) {
            Ok(report) => {
                if report.leased > 0 {
                    self.notifier
                        .send(&format!("Loaded {} keys from {}", report.leased, volume.volume_name));
                }
                Ok(report)
            }
            Err(e) => {
                self.abort_unlock(&vars, &progress);
                Err(e)
            }
        }
    }

    fn try_unlock(&mut self, vars: &ToolVars, progress: &mut Progress) -> Result<UnlockReport> {
        let key = self.load_key()?;

        self.decrypt(vars, key)?;
        progress.decrypted = true;

        let mount = self.settings.container_mount.clone();
        let entries = match probe::visible_entries(&mount) {
            Ok(Some(entries)) => entries,
            Ok(None) => return Err(Error::MountNotFound { path: mount }),
            Err(e) => {
                warn!(path = %mount.display(), error = %e, "cannot list container");
                return Err(Error::MountNotFound { path: mount });
            }
        };

        let mut report = UnlockReport::default();
        for entry in &entries {
            match self.agent.add_with_lease(entry, self.settings.lease) {
                Ok(()) => {
                    report.leased += 1;
                    progress.leased += 1;
                }
                Err(e) => {
                    warn!(key = %entry.display(), kind = e.kind(), error = %e, "agent rejected key");
                    report.rejected += 1;
                }
            }
        }

        self.run_tool("eject container", &vars.render(&self.settings.tools.eject_container))?;
        progress.decrypted = false;

        self.markers.create()?;
        info!(
            leased = report.leased,
            rejected = report.rejected,
            "credentials loaded"
        );
        Ok(report)
    }

    fn abort_unlock(&mut self, vars: &ToolVars, progress: &Progress) {
        if progress.leased > 0
            && let Err(e) = self.agent.purge_all()
        {
            warn!(kind = e.kind(), error = %e, "purge after failed unlock failed");
        }
        if progress.decrypted
            && let Err(e) =
                self.run_tool("eject container", &vars.render(&self.settings.tools.eject_container))
        {
            warn!(kind = e.kind(), error = %e, "container still attached after failed unlock");
        }
        if let Err(e) = self.run_tool("eject disk", &vars.render(&self.settings.tools.eject_disk)) {
            warn!(kind = e.kind(), error = %e, "token eject after failed unlock failed");
        }
    }

    /// Ejects the token once its contents were consumed.
    pub fn eject_token(&self, volume: &CandidateVolume) -> Result<()> {
        let vars = self.vars(volume);
        self.run_tool("eject disk", &vars.render(&self.settings.tools.eject_disk))
    }

    /// Removes the marker, purges the agent and locks the session.
    ///
    /// Every step is attempted; failures are logged.
    pub fn lock(&mut self) -> LockReport {
        let mut report = LockReport::default();

        match self.markers.delete() {
            Ok(removed) => report.marker_removed = removed,
            Err(e) => warn!(kind = e.kind(), error = %e, "failed to remove presence marker"),
        }

        match self.agent.purge_all() {
            Ok(()) => report.purged = true,
            Err(e) => warn!(kind = e.kind(), error = %e, "failed to purge agent"),
        }

        let spec = self
            .settings
            .tools
            .lock_session
            .render(&[])
            .timeout(self.settings.command_timeout);
        match self.shell.run_checked(&spec) {
            Ok(_) => {
                report.session_locked = true;
                info!("session locked");
            }
            Err(e) => {
                let e = Error::SessionLock {
                    message: e.to_string(),
                };
                warn!(kind = e.kind(), error = %e, "session not locked");
            }
        }

        report
    }

    fn vars(&self, volume: &CandidateVolume) -> ToolVars {
        ToolVars {
            volume: volume.mount_path.display().to_string(),
            image: volume
                .mount_path
                .join(&self.settings.container_image)
                .display()
                .to_string(),
            mount: self.settings.container_mount.display().to_string(),
            device: volume.device_node().display().to_string(),
            disk: volume.eject_target().display().to_string(),
        }
    }

    /// Reads the key file and checks it against the pin.
    fn load_key(&self) -> Result<Vec<u8>> {
        let path = &self.settings.key_path;
        if !probe::is_file(path) {
            return Err(Error::KeyMissing { path: path.clone() });
        }
        let key = match fs::read(path) {
            Ok(key) => key,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::KeyMissing { path: path.clone() });
            }
            Err(e) => return Err(e).key_context(path),
        };
        if key.is_empty() {
            return Err(Error::KeyMissing { path: path.clone() });
        }
        if let Some(pin) = &self.settings.key_sha256 {
            let digest = hex::encode(Sha256::digest(&key));
            if !digest.eq_ignore_ascii_case(pin) {
                return Err(Error::KeyMismatch { path: path.clone() });
            }
        }
        debug!(path = %path.display(), "key material verified");
        Ok(key)
    }

    fn decrypt(&self, vars: &ToolVars, key: Vec<u8>) -> Result<()> {
        let image = PathBuf::from(&vars.image);
        let spec = vars
            .render(&self.settings.tools.decrypt)
            .stdin(key)
            .timeout(self.settings.decrypt_timeout);
        match self.shell.run_checked(&spec) {
            Ok(_) => {
                info!(image = %image.display(), "container decrypted");
                Ok(())
            }
            Err(e) => Err(Error::DecryptFailed {
                image,
                message: e.to_string(),
            }),
        }
    }

    fn run_tool(&self, what: &str, spec: &CommandSpec) -> Result<()> {
        let spec = spec.clone().timeout(self.settings.command_timeout);
        self.shell
            .run_checked(&spec)
            .map(|_| debug!(command = %spec.display(), "{what} done"))
            .map_err(|e| Error::Eject {
                target: what.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::registry::DiskDescriptor;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct FakeShell {
        calls: Mutex<Vec<CommandSpec>>,
        fail: Mutex<Vec<&'static str>>,
    }

    impl FakeShell {
        fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.program.clone())
                .collect()
        }
    }

    impl ShellExecutor for FakeShell {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let code = if self.fail.lock().unwrap().iter().any(|p| *p == spec.program) {
                1
            } else {
                0
            };
            Ok(CommandOutput {
                exit_code: code,
                ..CommandOutput::default()
            })
        }
    }

    #[derive(Default)]
    struct AgentLog {
        added: Vec<PathBuf>,
        purges: usize,
    }

    struct FakeAgent(Arc<Mutex<AgentLog>>);

    impl SecretAgent for FakeAgent {
        fn add_with_lease(&mut self, path: &Path, _ttl: Duration) -> Result<()> {
            self.0.lock().unwrap().added.push(path.to_path_buf());
            Ok(())
        }

        fn purge_all(&mut self) -> Result<()> {
            self.0.lock().unwrap().purges += 1;
            Ok(())
        }
    }

    fn tools() -> ToolCommands {
        ToolCommands {
            decrypt: CommandTemplate::new("decrypt", ["{image}", "{mount}"]),
            eject_container: CommandTemplate::new("detach", ["{mount}"]),
            eject_disk: CommandTemplate::new("eject", ["{disk}"]),
            lock_session: CommandTemplate::new("lock", Vec::<String>::new()),
            notify: CommandTemplate::new("notify", ["{message}"]),
        }
    }

    struct Fixture {
        dir: TempDir,
        shell: Arc<FakeShell>,
        agent: Arc<Mutex<AgentLog>>,
        workflow: Workflow,
    }

    fn fixture(pin: Option<String>) -> Fixture {
        let dir = tempdir().unwrap();
        let mount = dir.path().join("container");
        fs::create_dir_all(&mount).unwrap();
        fs::write(mount.join("id_ed25519"), "k").unwrap();
        fs::write(mount.join(".DS_Store"), "x").unwrap();
        fs::write(dir.path().join("key"), b"hunter2").unwrap();

        let settings = WorkflowSettings {
            key_path: dir.path().join("key"),
            key_sha256: pin,
            container_image: "usbkey.crypt".into(),
            container_mount: mount,
            lease: Duration::from_secs(7200),
            command_timeout: Duration::from_secs(5),
            decrypt_timeout: Duration::from_secs(5),
            tools: tools(),
            notifications: false,
        };
        let shell = Arc::new(FakeShell::default());
        let agent = Arc::new(Mutex::new(AgentLog::default()));
        let workflow = Workflow::new(
            settings,
            shell.clone(),
            Box::new(FakeAgent(agent.clone())),
            MarkerStore::in_state_dir(dir.path()),
        );
        Fixture {
            dir,
            shell,
            agent,
            workflow,
        }
    }

    fn volume() -> CandidateVolume {
        CandidateVolume::from_descriptor(DiskDescriptor {
            device_node: PathBuf::from("/dev/sdb1"),
            whole_disk: Some(PathBuf::from("/dev/sdb")),
            volume_path: Some(PathBuf::from("/media/KEY")),
            volume_mountable: true,
            ..DiskDescriptor::default()
        })
        .unwrap()
    }

    #[test]
    fn test_unlock_pipes_key_and_writes_marker() {
        let mut fx = fixture(None);
        let report = fx.workflow.unlock(&volume()).unwrap();
        assert_eq!(report, UnlockReport { leased: 1, rejected: 0 });
        assert!(fx.workflow.markers().exists());

        let calls = fx.shell.calls.lock().unwrap();
        assert_eq!(calls[0].program, "decrypt");
        assert_eq!(calls[0].args[0], "/media/KEY/usbkey.crypt");
        assert_eq!(calls[0].stdin.as_deref(), Some(&b"hunter2"[..]));
        assert_eq!(calls[1].program, "detach");
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_pin_mismatch_aborts_before_decrypt() {
        let mut fx = fixture(Some("00".repeat(32)));
        let err = fx.workflow.unlock(&volume()).unwrap_err();
        assert_eq!(err.kind(), "key_mismatch");
        assert_eq!(fx.shell.programs(), vec!["eject"]);
        assert!(!fx.workflow.markers().exists());
    }

    #[test]
    fn test_matching_pin_unlocks() {
        let pin = hex::encode(Sha256::digest(b"hunter2"));
        let mut fx = fixture(Some(pin.to_uppercase()));
        assert!(fx.workflow.unlock(&volume()).is_ok());
        assert!(fx.workflow.markers().exists());
    }

    #[test]
    fn test_detach_failure_purges_and_ejects() {
        let mut fx = fixture(None);
        fx.shell.fail.lock().unwrap().push("detach");
        let err = fx.workflow.unlock(&volume()).unwrap_err();
        assert_eq!(err.kind(), "eject");
        assert_eq!(fx.agent.lock().unwrap().purges, 1);
        // Retry detach, then force-eject the token.
        assert_eq!(
            fx.shell.programs(),
            vec!["decrypt", "detach", "detach", "eject"]
        );
        assert!(!fx.workflow.markers().exists());
    }

    #[test]
    fn test_lock_attempts_every_step() {
        let mut fx = fixture(None);
        fx.workflow.markers().create().unwrap();
        fx.shell.fail.lock().unwrap().push("lock");

        let report = fx.workflow.lock();
        assert!(report.marker_removed);
        assert!(report.purged);
        assert!(!report.session_locked);
        assert_eq!(fx.agent.lock().unwrap().purges, 1);
    }
}
