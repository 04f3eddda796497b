//! I/O helpers: task files, configuration, session records and the assistant seam.

pub mod assistant;
pub mod attempt_log;
pub mod config;
pub mod probe;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod task_file;
pub mod task_store;
pub mod watcher;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Well-known paths inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Root directory of the workspace (contains `.taskpilot/`).
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path to `.taskpilot/`.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(".taskpilot")
    }

    /// Path to `config.toml`.
    pub fn config_path(&self) -> PathBuf {
        self.data_dir().join("config.toml")
    }

    /// Path to `.taskpilot/state/`.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir().join("state")
    }

    /// Path to `session.json`.
    pub fn session_path(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    /// Path to `.taskpilot/attempts/`.
    pub fn attempts_dir(&self) -> PathBuf {
        self.data_dir().join("attempts")
    }

    /// Spec directory for a configured (relative or absolute) `specs_dir`.
    pub fn specs_dir(&self, specs_dir: &str) -> PathBuf {
        self.root.join(specs_dir)
    }
}

/// Write `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
