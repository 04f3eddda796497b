//! Engine lifecycle states and the operator commands allowed in each.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    /// Terminal for the session that was stopped; a new `start` opens a fresh one.
    Stopped,
}

impl EngineState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The execution queue was exhausted.
    Completed,
    /// A terminal task failure stopped the run.
    Halted,
    /// The operator stopped the run.
    Stopped,
}

impl SessionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Stop,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State reached by applying `command` in `state`, or `None` when disallowed.
pub const fn transition(state: EngineState, command: Command) -> Option<EngineState> {
    match (state, command) {
        (EngineState::Idle | EngineState::Stopped, Command::Start) => Some(EngineState::Running),
        (EngineState::Running, Command::Pause) => Some(EngineState::Paused),
        (EngineState::Paused, Command::Resume) => Some(EngineState::Running),
        (EngineState::Running | EngineState::Paused, Command::Stop) => Some(EngineState::Stopped),
        _ => None,
    }
}
