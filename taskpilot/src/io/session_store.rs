//! Persisted session record (`.taskpilot/state/session.json`).
//!
//! Written after every state-affecting event so a crashed run can be inspected
//! and its retry counts resumed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::retry::RetryRecord;
use crate::core::state::{EngineState, SessionOutcome};
use crate::io::config::EngineConfig;
use crate::plan::TaskKey;

/// One engine decision, kept for the operator's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub at: DateTime<Utc>,
    pub task: Option<TaskKey>,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<SessionOutcome>,
    pub state: EngineState,
    pub active_spec: Option<String>,
    pub active_task: Option<TaskKey>,
    pub completed: Vec<TaskKey>,
    pub failed: Vec<TaskKey>,
    pub skipped: Vec<TaskKey>,
    /// Keyed by `spec:id`.
    pub retries: BTreeMap<String, RetryRecord>,
    pub decisions: Vec<Decision>,
    pub config: EngineConfig,
}

impl SessionRecord {
    pub fn open(config: EngineConfig) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            state: EngineState::Running,
            active_spec: None,
            active_task: None,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            retries: BTreeMap::new(),
            decisions: Vec::new(),
            config,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn close(&mut self, outcome: SessionOutcome, state: EngineState) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.state = state;
        self.active_task = None;
        self.active_spec = None;
    }

    pub fn retry_record(&mut self, key: &TaskKey) -> &mut RetryRecord {
        self.retries.entry(key.to_string()).or_default()
    }

    pub fn decide(&mut self, task: Option<&TaskKey>, action: &str, detail: impl Into<String>) {
        self.decisions.push(Decision {
            at: Utc::now(),
            task: task.cloned(),
            action: action.to_string(),
            detail: detail.into(),
        });
    }
}

/// Retry records of a previous session that never closed (crash).
pub fn recover_retries(previous: Option<&SessionRecord>) -> BTreeMap<String, RetryRecord> {
    match previous {
        Some(record) if !record.is_closed() => {
            info!(session = %record.session_id, "resuming retry counts from unclosed session");
            record.retries.clone()
        }
        _ => BTreeMap::new(),
    }
}

/// Load the session record, or `None` when no session has been recorded.
pub fn load_session(path: &Path) -> Result<Option<SessionRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading session record");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let record: SessionRecord = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    Ok(Some(record))
}

/// Atomically write the session record (temp file + rename).
pub fn write_session(path: &Path, record: &SessionRecord) -> Result<()> {
    debug!(path = %path.display(), session = %record.session_id, state = %record.state, "writing session record");
    let mut buf = serde_json::to_string_pretty(record).context("serialize session record")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Drop the retry history of `key` from the stored record so a reset task
/// starts with a full attempt budget. Returns whether anything was removed.
pub fn clear_retries(path: &Path, key: &TaskKey) -> Result<bool> {
    let Some(mut record) = load_session(path)? else {
        return Ok(false);
    };
    if record.retries.remove(&key.to_string()).is_none() {
        return Ok(false);
    }
    record.decide(Some(key), "reset", "operator reset");
    write_session(path, &record)?;
    Ok(true)
}
