//! Daemon bootstrap.
//!
//! Sets up logging to stderr and `<state_dir>/debug.log`, takes the
//! single-instance lock, wires termination signals to the stop flag and hands
//! control to [`Daemon`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use imagemount_core::{Config, Daemon, StopFlag};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;
use snafu::{ResultExt, Snafu};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Keeps the file writer flushing until the process exits.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Snafu)]
pub enum BootstrapError {
    #[snafu(display("Failed to load configuration: {source}"))]
    Config { source: imagemount_core::Error },

    #[snafu(display("Failed to create state directory {}: {source}", path.display()))]
    StateDir { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to open lock file {}: {source}", path.display()))]
    LockOpen { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to lock {}: {source}", path.display()))]
    Lock { path: PathBuf, source: Errno },

    #[snafu(display("Failed to install signal handlers: {source}"))]
    Signals { source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Loop,
    Once,
}

pub fn run(config_path: &Path, mode: Mode) -> Result<(), BootstrapError> {
    let config = Config::load_or_default(config_path).context(ConfigSnafu)?;
    fs::create_dir_all(&config.state_dir).context(StateDirSnafu {
        path: &config.state_dir,
    })?;
    init_logging(&config);
    info!(config = %config_path.display(), ?mode, "starting");

    let lock_path = config.lock_file();
    let Some(_lock) = acquire_lock(&lock_path)? else {
        info!(lock = %lock_path.display(), "another instance holds the lock, exiting");
        return Ok(());
    };

    let stop_file = config.stop_file();
    if fs::remove_file(&stop_file).is_ok() {
        warn!(path = %stop_file.display(), "removed stale stop file");
    }
    let stop = StopFlag::with_sentinel(stop_file);
    for signal in [SIGTERM, SIGINT, SIGHUP, SIGQUIT] {
        flag::register(signal, stop.handle()).context(SignalsSnafu)?;
    }

    let mut daemon = Daemon::from_config(config, stop);
    match mode {
        Mode::Loop => daemon.run(),
        Mode::Once => {
            let report = daemon.run_once();
            info!(?report, "single pass finished");
        }
    }
    info!("exiting");
    Ok(())
}

/// Logs to stderr and to a fresh log file per run. `RUST_LOG` overrides the
/// default `info` level.
fn init_logging(config: &Config) {
    use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(filter());

    let log_file = config.log_file();
    let file_layer = match (log_file.parent(), log_file.file_name()) {
        (Some(dir), Some(name)) => {
            let _ = fs::remove_file(&log_file);
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_filter(filter()))
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Takes an exclusive non-blocking lock. `None` if another process holds it.
fn acquire_lock(path: &Path) -> Result<Option<Flock<File>>, BootstrapError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .context(LockOpenSnafu { path })?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, source)) => Err(BootstrapError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");

        let first = acquire_lock(&path).unwrap();
        assert!(first.is_some());
        assert!(acquire_lock(&path).unwrap().is_none());

        drop(first);
        assert!(acquire_lock(&path).unwrap().is_some());
    }
}
