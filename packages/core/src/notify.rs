//! User-facing notifications.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

/// Fire-and-forget notification sink.
pub trait Notifier {
    fn notify(&self, text: &str);

    /// Rich notification about one title.
    fn toast(&self, title_id: &str, title_name: &str, message: &str) {
        self.notify(&format!("{message}: {title_name} ({title_id})"));
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) {
        info!(target: "notify", "{text}");
    }
}

/// Logs notifications and drops title toasts into a file picked up by the
/// shell overlay, as `<title_id>|<name>|<message>`.
#[derive(Debug, Clone)]
pub struct ToastFileNotifier {
    path: PathBuf,
}

impl ToastFileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for ToastFileNotifier {
    fn notify(&self, text: &str) {
        LogNotifier.notify(text);
    }

    fn toast(&self, title_id: &str, title_name: &str, message: &str) {
        info!(target: "notify", title_id, "{message}: {title_name}");
        if let Err(e) = fs::write(&self.path, format!("{title_id}|{title_name}|{message}")) {
            warn!(path = %self.path.display(), error = %e, "failed to write toast");
        }
    }
}
