//! External tool command templates.
//!
//! The container format and the session/notification tooling differ per OS,
//! so each external action is a [`CommandTemplate`] with `{placeholder}`
//! arguments filled in at call time. Defaults match the host platform and can
//! be overridden from the configuration file.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::executor::{CommandSpec, ShellExecutor};

/// Mount path of the token volume, e.g. `/Volumes/KEY`.
pub const VAR_VOLUME: &str = "volume";
/// Encrypted container image on the token.
pub const VAR_IMAGE: &str = "image";
/// Where the decrypted container is mounted.
pub const VAR_MOUNT: &str = "mount";
/// Partition device node, e.g. `/dev/sdb1` or `disk4s1`.
pub const VAR_DEVICE: &str = "device";
/// Whole-disk device node, e.g. `/dev/sdb` or `disk4`.
pub const VAR_DISK: &str = "disk";
/// Notification body.
pub const VAR_MESSAGE: &str = "message";

/// A program plus arguments that may contain `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitutes `vars` into the program and every argument.
    ///
    /// Unknown placeholders are left untouched.
    pub fn render(&self, vars: &[(&str, &str)]) -> CommandSpec {
        CommandSpec::new(substitute(&self.program, vars))
            .args(self.args.iter().map(|arg| substitute(arg, vars)))
    }
}

fn substitute(input: &str, vars: &[(&str, &str)]) -> String {
    let mut output = input.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{}}}", name);
        if output.contains(&placeholder) {
            output = output.replace(&placeholder, value);
        }
    }
    output
}

/// The set of external actions the presence workflow performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCommands {
    /// Attaches and decrypts the container; the key arrives on stdin.
    pub decrypt: CommandTemplate,
    /// Detaches the decrypted container.
    pub eject_container: CommandTemplate,
    /// Force-unmounts and ejects the token itself.
    pub eject_disk: CommandTemplate,
    /// Locks the interactive session.
    pub lock_session: CommandTemplate,
    /// Shows a transient desktop notification.
    pub notify: CommandTemplate,
}

impl Default for ToolCommands {
    #[cfg(target_os = "macos")]
    fn default() -> Self {
        Self {
            decrypt: CommandTemplate::new("hdiutil", ["attach", "-stdinpass", "{image}"]),
            eject_container: CommandTemplate::new("hdiutil", ["eject", "{mount}"]),
            eject_disk: CommandTemplate::new(
                "sh",
                [
                    "-c",
                    "diskutil unmountDisk force \"$0\" && diskutil eject \"$0\"",
                    "{disk}",
                ],
            ),
            lock_session: CommandTemplate::new(
                "/System/Library/CoreServices/Menu Extras/User.menu/Contents/Resources/CGSession",
                ["-suspend"],
            ),
            notify: CommandTemplate::new(
                "osascript",
                [
                    "-e",
                    "display notification \"{message}\" with title \"UsbkeyCtl\"",
                ],
            ),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn default() -> Self {
        Self {
            decrypt: CommandTemplate::new(
                "sh",
                [
                    "-c",
                    "mkdir -p \"$1\" && exec gocryptfs -passfile /dev/stdin \"$0\" \"$1\"",
                    "{image}",
                    "{mount}",
                ],
            ),
            eject_container: CommandTemplate::new("fusermount", ["-u", "{mount}"]),
            eject_disk: CommandTemplate::new(
                "udisksctl",
                ["unmount", "--force", "--no-user-interaction", "-b", "{device}"],
            ),
            lock_session: CommandTemplate::new("loginctl", ["lock-session"]),
            notify: CommandTemplate::new("notify-send", ["UsbkeyCtl", "{message}"]),
        }
    }
}

/// Best-effort desktop notifications.
#[derive(Clone)]
pub struct Notifier {
    shell: Arc<dyn ShellExecutor>,
    template: CommandTemplate,
    enabled: bool,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        shell: Arc<dyn ShellExecutor>,
        template: CommandTemplate,
        enabled: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            shell,
            template,
            enabled,
            timeout,
        }
    }

    /// Shows `message`. Failures are only logged.
    pub fn send(&self, message: &str) {
        if !self.enabled {
            return;
        }
        // The macOS template embeds the message in an AppleScript string.
        let message = message.replace('"', "'");
        let spec = self
            .template
            .render(&[(VAR_MESSAGE, message.as_str())])
            .timeout(self.timeout);
        if let Err(e) = self.shell.run_checked(&spec) {
            debug!(error = %e, "notification not shown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::executor::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ShellExecutor for Recorder {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.0.lock().unwrap().push(spec.display());
            Ok(CommandOutput {
                exit_code: 1,
                ..CommandOutput::default()
            })
        }
    }

    #[test]
    fn test_notifier_swallows_failures() {
        let shell = Arc::new(Recorder::default());
        let notifier = Notifier::new(
            shell.clone(),
            CommandTemplate::new("notify-send", ["UsbkeyCtl", "{message}"]),
            true,
            Duration::from_secs(1),
        );
        notifier.send("Detection has \"Started\"");
        assert_eq!(
            shell.0.lock().unwrap().as_slice(),
            ["notify-send UsbkeyCtl Detection has 'Started'"]
        );
    }

    #[test]
    fn test_disabled_notifier_runs_nothing() {
        let shell = Arc::new(Recorder::default());
        let notifier = Notifier::new(
            shell.clone(),
            ToolCommands::default().notify,
            false,
            Duration::from_secs(1),
        );
        notifier.send("Detection has Started");
        assert!(shell.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_render_substitutes_all_args() {
        let template = CommandTemplate::new("hdiutil", ["attach", "-stdinpass", "{image}"]);
        let spec = template.render(&[(VAR_IMAGE, "/Volumes/KEY/osx.sparseimage")]);
        assert_eq!(spec.program, "hdiutil");
        assert_eq!(
            spec.args,
            vec!["attach", "-stdinpass", "/Volumes/KEY/osx.sparseimage"]
        );
        assert!(spec.stdin.is_none());
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template = CommandTemplate::new("echo", ["{unknown}", "{mount}"]);
        let spec = template.render(&[(VAR_MOUNT, "/mnt/usbkey")]);
        assert_eq!(spec.args, vec!["{unknown}", "/mnt/usbkey"]);
    }

    #[test]
    fn test_render_inside_larger_argument() {
        let template = CommandTemplate::new("osascript", ["-e", "say \"{message}\""]);
        let spec = template.render(&[(VAR_MESSAGE, "hi")]);
        assert_eq!(spec.args[1], "say \"hi\"");
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let json = r#"{ "lock_session": { "program": "xdg-screensaver", "args": ["lock"] } }"#;
        let tools: ToolCommands = serde_json::from_str(json).unwrap();
        assert_eq!(tools.lock_session.program, "xdg-screensaver");
        assert_eq!(tools.decrypt, ToolCommands::default().decrypt);
    }
}
