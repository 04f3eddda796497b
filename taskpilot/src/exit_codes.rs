//! Stable exit codes for `taskpilot` commands.

/// Command succeeded; for `run`, the execution queue was exhausted.
pub const OK: i32 = 0;
/// Invalid config, plan or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `run` halted on a task failure.
pub const HALTED: i32 = 2;
/// `run` was stopped by the operator.
pub const STOPPED: i32 = 3;
