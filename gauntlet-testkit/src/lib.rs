//! Test support for gauntlet: matrix builders and a scriptable
//! in-process executor with execution recording.

pub mod matrix;
pub mod mock;

pub use matrix::{catalog, matrix, stage, step, step_with_command};
pub use mock::{Execution, MockExecutor};
