//! Error catalog entries.
//!
//! Each [`ErrorCode`] has a unique number rendered as `RMX-Exxx`, a message,
//! a category derived from the number range, and remediation steps.
//!
//! ```rust
//! use rmx_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::SessionAmbiguousJob.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all RMX error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Listen address could not be parsed or bound
    ConfigInvalidListen,
    /// Project home directory could not be determined or created
    ConfigHomeUnavailable,
    /// Host argument is not HOST or HOST:PORT
    ConfigInvalidHost,
    /// Ignore pattern could not be parsed
    ConfigInvalidIgnorePattern,

    // =========================================================================
    // Transfer Errors (E100-E199)
    // =========================================================================
    /// A tracked file could not be read while hashing
    TransferUnreadableFile,
    /// Patch archive is missing
    TransferArchiveMissing,
    /// Patch archive could not be decoded or extracted
    TransferArchiveCorrupt,
    /// A path in the patch escapes the project directory
    TransferUnsafePath,
    /// Patch payload is not valid base64
    TransferEncodingError,
    /// Building the content index failed
    TransferIndexFailed,

    // =========================================================================
    // Session Errors (E200-E299)
    // =========================================================================
    /// Reconnect id matches no job
    SessionUnknownJob,
    /// Reconnect id matches several running jobs
    SessionAmbiguousJob,
    /// Peer sent a message out of order
    SessionProtocolViolation,
    /// Connection closed mid-protocol
    SessionConnectionLost,

    // =========================================================================
    // Resource Errors (E300-E399)
    // =========================================================================
    /// GPU scheduling requested but the pool is empty
    ResourceGpuPoolEmpty,
    /// Released GPU id is not part of the pool
    ResourceUnknownGpu,

    // =========================================================================
    // Process Errors (E400-E499)
    // =========================================================================
    /// Job process could not be started
    ProcessSpawnFailed,
    /// Job process could not be signaled
    ProcessKillFailed,
    /// Job exit status could not be collected
    ProcessWaitFailed,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Daemon internal error
    InternalDaemonError,
    /// Logging initialization failed
    InternalLoggingError,
    /// Message could not be serialized
    InternalSerializationError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigEnvError => 1,
            Self::ConfigInvalidListen => 2,
            Self::ConfigHomeUnavailable => 3,
            Self::ConfigInvalidHost => 4,
            Self::ConfigInvalidIgnorePattern => 5,

            Self::TransferUnreadableFile => 100,
            Self::TransferArchiveMissing => 101,
            Self::TransferArchiveCorrupt => 102,
            Self::TransferUnsafePath => 103,
            Self::TransferEncodingError => 104,
            Self::TransferIndexFailed => 105,

            Self::SessionUnknownJob => 200,
            Self::SessionAmbiguousJob => 201,
            Self::SessionProtocolViolation => 202,
            Self::SessionConnectionLost => 203,

            Self::ResourceGpuPoolEmpty => 300,
            Self::ResourceUnknownGpu => 301,

            Self::ProcessSpawnFailed => 400,
            Self::ProcessKillFailed => 401,
            Self::ProcessWaitFailed => 402,

            Self::InternalDaemonError => 500,
            Self::InternalLoggingError => 501,
            Self::InternalSerializationError => 502,
        }
    }

    /// Returns the formatted error code string (e.g., "RMX-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("RMX-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Transfer,
            200..=299 => ErrorCategory::Session,
            300..=399 => ErrorCategory::Resource,
            400..=499 => ErrorCategory::Process,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigInvalidListen => "Listen address is invalid or unavailable",
            Self::ConfigHomeUnavailable => "Project home directory is unavailable",
            Self::ConfigInvalidHost => "Host must be HOST or HOST:PORT",
            Self::ConfigInvalidIgnorePattern => "Ignore pattern is malformed",

            Self::TransferUnreadableFile => "A tracked file could not be read",
            Self::TransferArchiveMissing => "Patch archive not found",
            Self::TransferArchiveCorrupt => "Patch archive is corrupt",
            Self::TransferUnsafePath => "Patch references a path outside the project",
            Self::TransferEncodingError => "Patch payload is not valid base64",
            Self::TransferIndexFailed => "Failed to build the content index",

            Self::SessionUnknownJob => "No job matches the given id",
            Self::SessionAmbiguousJob => "Several running jobs match the given id",
            Self::SessionProtocolViolation => "Unexpected message in session",
            Self::SessionConnectionLost => "Connection closed before the session completed",

            Self::ResourceGpuPoolEmpty => "GPU scheduling requested but no GPUs are configured",
            Self::ResourceUnknownGpu => "GPU id is not part of the configured pool",

            Self::ProcessSpawnFailed => "Failed to start the job process",
            Self::ProcessKillFailed => "Failed to terminate the job process",
            Self::ProcessWaitFailed => "Failed to collect the job exit status",

            Self::InternalDaemonError => "Internal job host error",
            Self::InternalLoggingError => "Failed to initialize logging",
            Self::InternalSerializationError => "Failed to serialize a protocol message",
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigEnvError => &[
                "Check RMX_* environment variables for typos",
                "Unset the variable to fall back to its default",
            ],
            Self::ConfigInvalidListen => &[
                "Use ADDR:PORT, e.g. 0.0.0.0:24454",
                "Check that no other process holds the port",
            ],
            Self::ConfigHomeUnavailable => &[
                "Set RMX_HOME or pass --home",
                "Check write permissions on the directory",
            ],
            Self::ConfigInvalidHost => &["Use HOST or HOST:PORT with a numeric port"],
            Self::ConfigInvalidIgnorePattern => &[
                "A '*' may only appear at the start or end of a pattern",
                "Patterns match single names; remove any '/'",
            ],

            Self::TransferUnreadableFile => &[
                "Check file permissions in the project tree",
                "Add the file to .syncignore if it should not be synced",
            ],
            Self::TransferArchiveMissing => &["Retry the run; the upload did not complete"],
            Self::TransferArchiveCorrupt => &[
                "Retry the run",
                "Check free disk space on the job host",
            ],
            Self::TransferUnsafePath => &["Check the client version; paths must stay inside the project"],
            Self::TransferEncodingError => &["Retry the run; the payload was damaged in transit"],
            Self::TransferIndexFailed => &[
                "Check that the project directory exists and is readable",
                "Fix or remove malformed .syncignore entries",
            ],

            Self::SessionUnknownJob => &[
                "List jobs with 'rmx jobs HOST'",
                "Use the full id printed when the job started",
            ],
            Self::SessionAmbiguousJob => &["Use one of the full job ids listed"],
            Self::SessionProtocolViolation => &["Make sure client and host run the same rmx version"],
            Self::SessionConnectionLost => &[
                "Check network connectivity to the host",
                "Running jobs keep going; reattach with 'rmx attach'",
            ],

            Self::ResourceGpuPoolEmpty => &[
                "Start rmxd with --gpus or RMX_GPUS",
                "Run with --gpu all to skip scheduling",
            ],
            Self::ResourceUnknownGpu => &["Report this as a bug"],

            Self::ProcessSpawnFailed => &[
                "Check that the program exists on the job host",
                "Check PATH for the rmxd process",
            ],
            Self::ProcessKillFailed => &["The process may already have exited; list jobs to confirm"],
            Self::ProcessWaitFailed => &["Check system logs on the job host"],

            Self::InternalDaemonError => &[
                "Check rmxd logs (run with -v for more detail)",
                "Restart rmxd",
            ],
            Self::InternalLoggingError => &[
                "Check RMX_LOG_FILE points to a writable location",
                "Check RMX_LOG_LEVEL syntax",
            ],
            Self::InternalSerializationError => &["Report this as a bug"],
        }
    }

    /// Returns all error codes, in numeric order.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigEnvError,
            Self::ConfigInvalidListen,
            Self::ConfigHomeUnavailable,
            Self::ConfigInvalidHost,
            Self::ConfigInvalidIgnorePattern,
            Self::TransferUnreadableFile,
            Self::TransferArchiveMissing,
            Self::TransferArchiveCorrupt,
            Self::TransferUnsafePath,
            Self::TransferEncodingError,
            Self::TransferIndexFailed,
            Self::SessionUnknownJob,
            Self::SessionAmbiguousJob,
            Self::SessionProtocolViolation,
            Self::SessionConnectionLost,
            Self::ResourceGpuPoolEmpty,
            Self::ResourceUnknownGpu,
            Self::ProcessSpawnFailed,
            Self::ProcessKillFailed,
            Self::ProcessWaitFailed,
            Self::InternalDaemonError,
            Self::InternalLoggingError,
            Self::InternalSerializationError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Environment and command-line setup (E001-E099)
    Config,
    /// Hashing, packing and applying patches (E100-E199)
    Transfer,
    /// Protocol and job resolution (E200-E299)
    Session,
    /// GPU pool scheduling (E300-E399)
    Resource,
    /// Job process lifecycle (E400-E499)
    Process,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Transfer => "Transfer",
            Self::Session => "Session",
            Self::Resource => "Resource",
            Self::Process => "Process",
            Self::Internal => "Internal",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Config => "Environment and command-line setup issues",
            Self::Transfer => "Project synchronization and patch issues",
            Self::Session => "Session protocol and job lookup issues",
            Self::Resource => "GPU scheduling issues",
            Self::Process => "Job process start and supervision issues",
            Self::Internal => "Internal errors that may indicate bugs",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "RMX-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(seen.insert(num), "Duplicate error code number: {num} for {code:?}");
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigEnvError.code_string(), "RMX-E001");
        assert_eq!(ErrorCode::TransferUnreadableFile.code_string(), "RMX-E100");
        assert_eq!(ErrorCode::SessionAmbiguousJob.code_string(), "RMX-E201");
        assert_eq!(ErrorCode::ResourceGpuPoolEmpty.code_string(), "RMX-E300");
        assert_eq!(ErrorCode::ProcessSpawnFailed.code_string(), "RMX-E400");
        assert_eq!(ErrorCode::InternalDaemonError.code_string(), "RMX-E500");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let num = code.code_number();
            let expected = match num {
                1..=99 => ErrorCategory::Config,
                100..=199 => ErrorCategory::Transfer,
                200..=299 => ErrorCategory::Session,
                300..=399 => ErrorCategory::Resource,
                400..=499 => ErrorCategory::Process,
                _ => ErrorCategory::Internal,
            };
            assert_eq!(code.category(), expected, "{code:?}");
        }
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{code:?} has empty message");
            assert!(!code.remediation().is_empty(), "{code:?} has no remediation");
        }
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::SessionAmbiguousJob).unwrap();
        assert_eq!(json, "\"SESSION_AMBIGUOUS_JOB\"");
        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorCode::SessionAmbiguousJob);
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::SessionUnknownJob.entry();
        assert_eq!(entry.format_brief(), "[RMX-E200] No job matches the given id");
        let full = entry.format_full();
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("rmx jobs HOST"));
    }

    #[test]
    fn test_display_implementations() {
        let display = ErrorCode::ConfigEnvError.to_string();
        assert!(display.starts_with("RMX-E001: "));
        assert_eq!(ErrorCategory::Resource.to_string(), "Resource");
    }
}
