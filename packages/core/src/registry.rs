//! Title database access.
//!
//! The daemon only needs two questions answered: does a title already exist,
//! and register this installed folder. [`CommandRegistry`] answers the first
//! from the application tree and delegates the second to an external
//! registrar program.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CollaboratorSnafu, Error, IoResultExt, Result};

/// Registrar exit code for "already registered".
pub const EXIT_ALREADY_REGISTERED: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

pub trait TitleDatabase {
    fn title_exists(&self, title_id: &str) -> Result<bool>;

    /// Registers `title_id` installed under `app_root`.
    ///
    /// A refusal is reported as [`Error::Register`] with the registrar's code.
    fn register(&mut self, title_id: &str, app_root: &Path) -> Result<RegisterOutcome>;
}

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    user_app_root: PathBuf,
    command: Vec<String>,
    settle: Duration,
}

impl CommandRegistry {
    pub fn new(user_app_root: impl Into<PathBuf>, command: Vec<String>, settle: Duration) -> Self {
        Self {
            user_app_root: user_app_root.into(),
            command,
            settle,
        }
    }
}

impl TitleDatabase for CommandRegistry {
    fn title_exists(&self, title_id: &str) -> Result<bool> {
        Ok(self.user_app_root.join(title_id).exists())
    }

    fn register(&mut self, title_id: &str, app_root: &Path) -> Result<RegisterOutcome> {
        let Some((program, args)) = self.command.split_first() else {
            return CollaboratorSnafu {
                message: "no registrar command configured",
            }
            .fail();
        };

        let output = Command::new(program)
            .args(args)
            .arg(title_id)
            .arg(app_root)
            .output()
            .command_context(program.as_str())?;
        std::thread::sleep(self.settle);

        match output.status.code() {
            Some(0) => Ok(RegisterOutcome::Registered),
            Some(EXIT_ALREADY_REGISTERED) => Ok(RegisterOutcome::AlreadyRegistered),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(title_id, code, stderr = %stderr.trim(), "registrar refused title");
                let stdout = String::from_utf8_lossy(&output.stdout);
                debug!(title_id, stdout = %stdout.trim(), "registrar output");
                Err(Error::Register {
                    title_id: title_id.to_string(),
                    code: code.unwrap_or(-1),
                })
            }
        }
    }
}
