//! Cooperative cancellation.
//!
//! A [`StopFlag`] is set by the signal handlers installed by the daemon binary
//! or by the presence of a sentinel file, which is removed once observed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that also trips when `path` exists.
    pub fn with_sentinel(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            sentinel: Some(path.into()),
        }
    }

    /// Shared handle for signal registration.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel.as_deref()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    pub fn should_stop(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        let Some(sentinel) = self.sentinel.as_deref() else {
            return false;
        };
        if !sentinel.exists() {
            return false;
        }
        info!(path = %sentinel.display(), "stop sentinel found");
        if let Err(e) = std::fs::remove_file(sentinel) {
            warn!(path = %sentinel.display(), error = %e, "failed to remove stop sentinel");
        }
        self.request();
        true
    }

    /// Sleeps for `total` in `chunk` steps. Returns true if interrupted.
    pub fn sleep(&self, total: Duration, chunk: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.should_stop() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(chunk.min(deadline - now).max(Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_shared_with_handle() {
        let stop = StopFlag::new();
        assert!(!stop.should_stop());
        stop.handle().store(true, Ordering::SeqCst);
        assert!(stop.should_stop());
    }

    #[test]
    fn test_sentinel_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("STOP");
        let stop = StopFlag::with_sentinel(&sentinel);
        assert!(!stop.should_stop());

        std::fs::write(&sentinel, b"").unwrap();
        assert!(stop.should_stop());
        assert!(!sentinel.exists());
        // stays set after the file is gone
        assert!(stop.should_stop());
    }

    #[test]
    fn test_sleep_returns_early_when_stopped() {
        let stop = StopFlag::new();
        stop.request();
        let start = Instant::now();
        assert!(stop.sleep(Duration::from_secs(5), Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let stop = StopFlag::new();
        assert!(!stop.sleep(Duration::from_millis(20), Duration::from_millis(5)));
    }
}
