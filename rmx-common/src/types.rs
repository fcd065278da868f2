//! Common types used across RMX components.

use serde::{Deserialize, Serialize};

/// Identifier of a job on one job host: `<counter>-<name>`.
///
/// The counter is monotonic per host instance, so an id is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an id from the host counter and the client-declared name.
    pub fn compose(counter: u64, name: &str) -> Self {
        Self(format!("{counter}-{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name portion (everything after the counter), or the whole id when
    /// it carries no counter.
    pub fn name_part(&self) -> &str {
        split_counter(&self.0).map_or(&self.0, |(_, name)| name)
    }

    /// Whether a user-supplied reference starts with the numeric counter a
    /// host-issued id always carries.
    pub fn has_counter_prefix(reference: &str) -> bool {
        split_counter(reference).is_some()
    }
}

fn split_counter(id: &str) -> Option<(u64, &str)> {
    let (counter, name) = id.split_once('-')?;
    if name.is_empty() {
        return None;
    }
    counter.parse::<u64>().ok().map(|n| (n, name))
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the job should be bound to GPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuMode {
    /// No binding; the process sees every device.
    #[default]
    All,
    /// Wait for a free id from the host's pool and bind the job to it.
    Schedule,
}

impl std::str::FromStr for GpuMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "schedule" => Ok(Self::Schedule),
            other => Err(format!("unknown gpu mode '{other}' (expected all|schedule)")),
        }
    }
}

/// What kind of program the client launched. Informational for the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Shell,
    Python,
    Nodejs,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Python => write!(f, "python"),
            Self::Nodejs => write!(f, "nodejs"),
        }
    }
}

/// Environment descriptor a client presents when opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnv {
    #[serde(default)]
    pub mode: LaunchMode,
    #[serde(default)]
    pub gpu: GpuMode,
    /// Job to reattach to instead of starting a new one.
    #[serde(default)]
    pub reconnect: Option<String>,
    /// Declared job name (exported to the child as `RMX_JOB_NAME`).
    pub name: String,
    /// Forcefully terminate the reattached job.
    #[serde(default)]
    pub kill: bool,
}

impl SessionEnv {
    /// Descriptor for a fresh job.
    pub fn new_job(name: impl Into<String>, mode: LaunchMode, gpu: GpuMode) -> Self {
        Self {
            mode,
            gpu,
            reconnect: None,
            name: name.into(),
            kill: false,
        }
    }

    /// Descriptor for reattaching to (and optionally killing) a job.
    pub fn reattach(reference: impl Into<String>, kill: bool) -> Self {
        let reference = reference.into();
        Self {
            name: reference.clone(),
            reconnect: Some(reference),
            kill,
            ..Default::default()
        }
    }
}

/// Lifecycle state of a job as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Process handle exists and output is being polled.
    Running,
    /// Process exited on its own.
    Finished,
    /// Process was terminated by a kill request.
    Killed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// One row of a job listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub project: String,
    pub state: JobState,
    #[serde(default)]
    pub gpu: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// RFC 3339 start time.
    pub started_at: String,
    pub command: Vec<String>,
}
