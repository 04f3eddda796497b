//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod completion;
pub mod dependency;
pub mod queue;
pub mod retry;
pub mod state;
pub mod task_id;
