//! Secret agent bridge.
//!
//! Keys found in the decrypted container are handed to `ssh-agent` with a
//! bounded lifetime and purged wholesale when the token goes away.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::executor::{CommandSpec, ShellExecutor};

/// Something that can hold credentials on the user's behalf.
pub trait SecretAgent: Send {
    /// Adds the credential at `path`, expiring after `ttl`.
    fn add_with_lease(&mut self, path: &Path, ttl: Duration) -> Result<()>;

    /// Removes every credential the agent holds.
    fn purge_all(&mut self) -> Result<()>;
}

/// [`SecretAgent`] driving `ssh-add` against the running `ssh-agent`.
pub struct SshAgent {
    shell: Arc<dyn ShellExecutor>,
    program: String,
    timeout: Duration,
}

impl SshAgent {
    pub fn new(shell: Arc<dyn ShellExecutor>, timeout: Duration) -> Self {
        Self {
            shell,
            program: "ssh-add".to_string(),
            timeout,
        }
    }

    /// Uses a different `ssh-add` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn invoke(&self, operation: &str, spec: CommandSpec) -> Result<()> {
        let output = self
            .shell
            .run(&spec.timeout(self.timeout))
            .map_err(|e| Error::CredentialBridge {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(Error::CredentialBridge {
                operation: operation.to_string(),
                message: format!(
                    "{} exited with code {}: {}",
                    self.program,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

impl SecretAgent for SshAgent {
    fn add_with_lease(&mut self, path: &Path, ttl: Duration) -> Result<()> {
        let spec = CommandSpec::new(&self.program)
            .arg("-t")
            .arg(ttl.as_secs().to_string())
            .arg(path.to_string_lossy());
        self.invoke("add", spec)?;
        info!(key = %path.display(), ttl_secs = ttl.as_secs(), "credential leased to agent");
        Ok(())
    }

    fn purge_all(&mut self) -> Result<()> {
        self.invoke("purge", CommandSpec::new(&self.program).arg("-D"))?;
        info!("removed all credentials from agent");
        Ok(())
    }
}
