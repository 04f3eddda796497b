//! Spec-driven task automation engine.
//!
//! Specs live under `<workspace>/.kiro/specs/<name>/tasks.md` as markdown
//! checklists. The engine orders their tasks by dependency, hands each one to
//! an external assistant, decides from the response whether it succeeded,
//! retries transient failures and writes progress back to the checklist.
//!
//! - **[`core`]**: pure logic (ordering, retry policy, completion verdicts,
//!   lifecycle transitions). No I/O.
//! - **[`io`]**: side effects (task files, config, session records, the
//!   assistant seam, file watching).
//! - **[`supervisor`]**: resource thresholds, leak detection, bounded caches
//!   and session-scoped cleanup.
//! - **[`engine`]**: the session loop tying the three together.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
