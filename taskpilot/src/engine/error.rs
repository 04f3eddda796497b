//! Errors returned by engine commands.

use thiserror::Error;

use crate::core::state::{Command, EngineState};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The command is not allowed in the current state. Nothing changed.
    #[error("cannot {command} while {state}")]
    InvalidState { command: Command, state: EngineState },

    /// `start` after `stop` while the stopped session is still winding down.
    #[error("the previous session is still shutting down")]
    ShuttingDown,

    #[error("automation is disabled in configuration")]
    Disabled,

    /// Cyclic or unknown dependencies. Nothing was dispatched.
    #[error("invalid plan: {}", .problems.join("; "))]
    InvalidPlan { problems: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for problems retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Disabled | Self::InvalidPlan { .. })
    }
}
