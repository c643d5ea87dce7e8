//! usbkeyd - keeps SSH keys loaded while the USB token is plugged in.
//!
//! Watches for the token, unlocks on insertion, purges the agent and locks
//! the session on removal. Runs in the foreground until SIGINT or SIGTERM.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use usbkey_core::{
    DaemonConfig, NotificationSource, PresenceMachine, ShellExecutor, SystemShell, WatchSession,
};

/// USB token presence daemon.
#[derive(Parser, Debug)]
#[command(name = "usbkeyd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to <config_dir>/usbkey/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum DaemonError {
    #[snafu(display("failed to open log file {}", path.display()))]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to set up signal handling"))]
    Signals { source: nix::errno::Errno },

    #[snafu(display("failed to start signal thread"))]
    SignalThread { source: std::io::Error },

    #[snafu(display("no device notification backend for this platform"))]
    UnsupportedPlatform,

    #[snafu(transparent)]
    Core { source: usbkey_core::Error },
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("usbkeyd: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&args) {
        error!(error = %e, "usbkeyd stopped");
        std::process::exit(1);
    }
}

fn init_logging(args: &Args) -> Result<(), DaemonError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context(LogFileSnafu { path: log_file })?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), DaemonError> {
    // Must happen before any thread is spawned; the mask is inherited.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context(SignalsSnafu)?;

    let config = DaemonConfig::load(args.config.as_deref())?;
    let shell: Arc<dyn ShellExecutor> =
        Arc::new(SystemShell::with_default_timeout(config.command_timeout()));
    let mut machine = PresenceMachine::from_config(&config, shell)?;
    info!(state = ?machine.state(), "presence machine ready");

    let (tx, rx) = mpsc::channel();
    let mut source = notification_source(&config)?;
    let mut session = WatchSession::open(&config.identity, source.as_mut(), tx)?;

    let notifier = machine.workflow().notifier().clone();
    notifier.send("Detection has Started");

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    thread::Builder::new()
        .name("usbkey-signals".to_string())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                info!(?signal, "shutdown requested");
                flag.store(true, Ordering::Release);
            }
            Err(e) => warn!(error = %e, "sigwait failed; signals will not stop the daemon"),
        })
        .context(SignalThreadSnafu)?;

    machine.run_until(&rx, &stop);

    session.close();
    notifier.send("Detection has Stopped");
    info!(state = ?machine.state(), "usbkeyd exiting");
    Ok(())
}

#[cfg(target_os = "linux")]
fn notification_source(config: &DaemonConfig) -> Result<Box<dyn NotificationSource>, DaemonError> {
    Ok(Box::new(usbkey_core::UdevSource::new(config.mount_recheck())))
}

#[cfg(not(target_os = "linux"))]
fn notification_source(_config: &DaemonConfig) -> Result<Box<dyn NotificationSource>, DaemonError> {
    UnsupportedPlatformSnafu.fail()
}
