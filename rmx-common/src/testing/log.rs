//! Structured JSONL logs for test runs.
//!
//! Tests that spawn real job processes are timing sensitive; when one fails
//! in CI the JSONL trail under `target/test-logs/` shows what the job host
//! was doing at the time.
//!
//! ```ignore
//! #[test]
//! fn test_example() {
//!     let _guard = rmx_common::test_guard!();
//!     tracing::info!(job_id = "1-x", "captured in JSONL");
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
}

/// One line of a per-test JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a global subscriber: JSON spans and events to
/// `target/test-logs/all_tests.jsonl` (or `RMX_TEST_LOG_FILE`), compact text
/// to the test writer. Only the first call has any effect.
///
/// `RMX_TEST_LOG_LEVEL` sets the level for the workspace crates.
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let path = std::env::var_os("RMX_TEST_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| test_log_dir().join("all_tests.jsonl"));
        let json = create_log_file(path).map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(true)
        });
        let text = tracing_subscriber::fmt::layer().with_test_writer().compact();

        let level = std::env::var("RMX_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".into());
        let filter = EnvFilter::try_new(
            ["rmx_common", "rmxd", "rmx"].map(|krate| format!("{krate}={level}")).join(","),
        )
        .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(filter).with(json).with(text),
        );
    });
}

fn create_log_file(path: PathBuf) -> Option<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    File::create(path).ok()
}

/// `$CARGO_TARGET_DIR/test-logs`, or `test-logs` in the nearest `target`
/// directory above the current one.
fn test_log_dir() -> PathBuf {
    if let Some(target) = std::env::var_os("CARGO_TARGET_DIR") {
        return PathBuf::from(target).join("test-logs");
    }
    std::env::current_dir()
        .ok()
        .and_then(|cwd| {
            cwd.ancestors()
                .map(|dir| dir.join("target"))
                .find(|target| target.is_dir())
        })
        .unwrap_or_else(|| PathBuf::from("target"))
        .join("test-logs")
}

/// Per-test JSONL writer that also keeps its entries.
pub struct TestLogger {
    test_name: String,
    started: Instant,
    file: Option<Mutex<File>>,
    entries: Mutex<Vec<TestLogEntry>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let file_name = format!("{}.jsonl", test_name.replace("::", "_").replace(['/', '\\'], "_"));
        let logger = Self {
            test_name: test_name.to_string(),
            started: Instant::now(),
            file: create_log_file(test_log_dir().join(file_name)).map(Mutex::new),
            entries: Mutex::new(Vec::new()),
        };
        logger.log(TestPhase::Setup, "TEST START", None);
        logger
    }

    pub fn log(&self, phase: TestPhase, message: &str, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: self.test_name.clone(),
            phase,
            message: message.to_string(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            data,
        };
        tracing::info!(test = %entry.test_name, phase = ?entry.phase, elapsed_ms = entry.elapsed_ms, "{message}");

        if let Some(file) = &self.file
            && let Ok(line) = serde_json::to_string(&entry)
        {
            let _ = writeln!(file.lock().unwrap_or_else(|e| e.into_inner()), "{line}");
        }
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    pub fn entries(&self) -> Vec<TestLogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Logs TEST PASS when dropped normally and TEST FAIL when dropped by a
/// panic. Active with `RMX_TEST_LOGGING=1`, or under `CI` unless
/// `RMX_TEST_LOGGING=0`.
pub struct TestGuard {
    logger: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let enabled = match std::env::var("RMX_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var_os("CI").is_some(),
        };
        let logger = enabled.then(|| {
            init_global_test_logging();
            TestLogger::for_test(test_name)
        });
        Self { logger }
    }

    pub fn log(&self, phase: TestPhase, message: &str) {
        if let Some(logger) = &self.logger {
            logger.log(phase, message, None);
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        let Some(logger) = self.logger.take() else {
            return;
        };
        if std::thread::panicking() {
            logger.log(
                TestPhase::Verify,
                "TEST FAIL",
                Some(serde_json::json!({ "reason": "test panicked" })),
            );
        } else {
            logger.log(TestPhase::Verify, "TEST PASS", None);
        }
    }
}

/// A [`TestGuard`] named after the enclosing test function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _here() {}
        fn _name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let path = _name_of(_here);
        let path = path.strip_suffix("::_here").unwrap_or(path);
        $crate::testing::TestGuard::new(path.rsplit("::").next().unwrap_or(path))
    }};
}
