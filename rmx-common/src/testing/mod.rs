//! Test support shared by every crate in the workspace.

pub mod log;

pub use log::{TestGuard, TestLogEntry, TestLogger, TestPhase, init_global_test_logging};
