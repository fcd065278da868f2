//! Session protocol between `rmx` and `rmxd`.
//!
//! One JSON object per line. A fresh-job session runs:
//!
//! ```text
//! client                          server
//! Hello { project, env }   --->
//!                          <---   HashIndex { index }
//! Patch { archive, deleted } -->
//! Run { argv } | SyncOnly  --->
//!                          <---   JobStarted { job_id } | Synced { .. }
//!                          <---   Output { chunk } ...
//!                          <---   Finished { .. }
//! ```
//!
//! A reattach session sends only `Hello` (with `env.reconnect` set) and then
//! reads. `ListJobs` is answered with `Jobs` and the connection closes. Any
//! step may be answered with `Failure`, after which the server closes.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::hash_index::HashIndex;
use crate::types::{JobId, JobState, JobSummary, SessionEnv};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { project: String, env: SessionEnv },
    ListJobs,
    /// `archive` is the base64 patch archive, absent when nothing changed.
    Patch {
        #[serde(default)]
        archive: Option<String>,
        #[serde(default)]
        deleted: Vec<String>,
    },
    Run { argv: Vec<String> },
    SyncOnly,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::ListJobs => "list_jobs",
            Self::Patch { .. } => "patch",
            Self::Run { .. } => "run",
            Self::SyncOnly => "sync_only",
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HashIndex { index: HashIndex },
    JobStarted { job_id: JobId },
    Output { chunk: String },
    Finished {
        job_id: JobId,
        state: JobState,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    Synced { changed: usize, deleted: usize },
    Jobs { jobs: Vec<JobSummary> },
    Failure(SessionFailure),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HashIndex { .. } => "hash_index",
            Self::JobStarted { .. } => "job_started",
            Self::Output { .. } => "output",
            Self::Finished { .. } => "finished",
            Self::Synced { .. } => "synced",
            Self::Jobs { .. } => "jobs",
            Self::Failure(_) => "failure",
        }
    }
}

/// Why the server ended a session early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub code: ErrorCode,
    pub message: String,
    /// Live job ids, for resolution failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobId>,
}

impl SessionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            jobs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: Vec<JobId>) -> Self {
        self.jobs = jobs;
        self
    }
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.code_string(), self.message)?;
        if !self.jobs.is_empty() {
            let ids: Vec<&str> = self.jobs.iter().map(JobId::as_str).collect();
            write!(f, " (jobs: {})", ids.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for SessionFailure {}
