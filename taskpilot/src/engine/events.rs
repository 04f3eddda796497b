//! Lifecycle events broadcast to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::retry::ErrorKind;
use crate::core::state::{EngineState, SessionOutcome};
use crate::plan::TaskKey;
use crate::supervisor::PerformanceAlert;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    SessionStarted {
        session_id: Uuid,
        at: DateTime<Utc>,
    },
    TaskStarted {
        session_id: Uuid,
        task: TaskKey,
        title: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        session_id: Uuid,
        task: TaskKey,
        title: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    TaskFailed {
        session_id: Uuid,
        task: TaskKey,
        title: String,
        kind: ErrorKind,
        message: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    TaskRetrying {
        session_id: Uuid,
        task: TaskKey,
        title: String,
        kind: ErrorKind,
        next_attempt: u32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },
    TaskSkipped {
        session_id: Uuid,
        task: TaskKey,
        title: String,
        reason: String,
        at: DateTime<Utc>,
    },
    SessionPaused {
        session_id: Uuid,
        at: DateTime<Utc>,
    },
    SessionResumed {
        session_id: Uuid,
        at: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: Uuid,
        outcome: SessionOutcome,
        completed: usize,
        failed: usize,
        skipped: usize,
        at: DateTime<Utc>,
    },
    SessionStopped {
        session_id: Uuid,
        at: DateTime<Utc>,
    },
    StateChanged {
        from: EngineState,
        to: EngineState,
        at: DateTime<Utc>,
    },
    PerformanceAlert {
        session_id: Uuid,
        alert: PerformanceAlert,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session-started",
            Self::TaskStarted { .. } => "task-started",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::TaskRetrying { .. } => "task-retrying",
            Self::TaskSkipped { .. } => "task-skipped",
            Self::SessionPaused { .. } => "session-paused",
            Self::SessionResumed { .. } => "session-resumed",
            Self::SessionCompleted { .. } => "session-completed",
            Self::SessionStopped { .. } => "session-stopped",
            Self::StateChanged { .. } => "state-changed",
            Self::PerformanceAlert { .. } => "performance-alert",
        }
    }

    /// Task the event is about, if any.
    pub fn task(&self) -> Option<&TaskKey> {
        match self {
            Self::TaskStarted { task, .. }
            | Self::TaskCompleted { task, .. }
            | Self::TaskFailed { task, .. }
            | Self::TaskRetrying { task, .. }
            | Self::TaskSkipped { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { at, .. }
            | Self::TaskStarted { at, .. }
            | Self::TaskCompleted { at, .. }
            | Self::TaskFailed { at, .. }
            | Self::TaskRetrying { at, .. }
            | Self::TaskSkipped { at, .. }
            | Self::SessionPaused { at, .. }
            | Self::SessionResumed { at, .. }
            | Self::SessionCompleted { at, .. }
            | Self::SessionStopped { at, .. }
            | Self::StateChanged { at, .. }
            | Self::PerformanceAlert { at, .. } => *at,
        }
    }
}
