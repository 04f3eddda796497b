//! Attempt logging helpers for `.taskpilot/attempts/`.
//!
//! Product artifacts, independent of `RUST_LOG`: every dispatched attempt
//! leaves its prompt, the response text received and a small metadata file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::retry::ErrorKind;
use crate::plan::TaskKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    Failed,
    /// Interrupted by stop without a verdict.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub session_id: String,
    pub task: TaskKey,
    pub attempt: u32,
    pub result: AttemptResult,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub meta_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, session_id: &str, task: &TaskKey, attempt: u32) -> Self {
        let dir = attempts_dir
            .join(session_id)
            .join(&task.spec)
            .join(&task.id)
            .join(attempt.to_string());
        Self {
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.md"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub attempts_dir: &'a Path,
    pub meta: &'a AttemptMeta,
    pub prompt: &'a str,
    pub response: &'a str,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let meta = request.meta;
    let paths = AttemptPaths::new(
        request.attempts_dir,
        &meta.session_id,
        &meta.task,
        meta.attempt,
    );
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    write_text(&paths.prompt_path, request.prompt)?;
    write_text(&paths.response_path, request.response)?;
    write_json(&paths.meta_path, meta)?;

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
