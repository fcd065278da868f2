//! Shared building blocks for RMX.
//!
//! Everything the client (`rmx`) and the job host (`rmxd`) must agree on lives
//! here: the content index and ignore rules, the patch engine, the output
//! buffer state machine, the session protocol and its transport, plus the
//! ambient config, logging and error catalog.

pub mod config;
pub mod errors;
pub mod hash_index;
pub mod ignore;
pub mod logging;
pub mod output_buffer;
pub mod patch;
pub mod protocol;
pub mod testing;
pub mod transport;
pub mod types;
pub mod util;

pub use config::{ConfigSource, Sourced};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use hash_index::{HashIndex, IndexError, MANIFEST_NAME};
pub use ignore::{DEFAULT_IGNORES, IgnoreRule, IgnoreSet, SYNCIGNORE_FILE};
pub use logging::{LogConfig, LogFormat, LogGuards, init_logging};
pub use output_buffer::{Cursor, OutputBuffer};
pub use patch::{DiffResult, PackOutcome, PatchError};
pub use protocol::{ClientMessage, ServerMessage, SessionFailure};
pub use transport::{MessageStream, Transport, TransportError};
pub use types::{GpuMode, JobId, JobState, JobSummary, LaunchMode, SessionEnv};

/// Default TCP port the job host listens on.
pub const DEFAULT_PORT: u16 = 24454;
