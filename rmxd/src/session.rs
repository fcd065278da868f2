//! Session driver: one client connection, served on its own thread.
//!
//! A session either lists jobs, syncs a project and optionally starts a job,
//! or reattaches to an existing job. Job sessions end in the streaming loop,
//! which forwards output increments for the session's own cursor until the
//! job ends or the client goes away.

use rmx_common::patch::{self, ARCHIVE_EXTENSION, PatchError};
use rmx_common::util::sanitize_project_name;
use rmx_common::{
    ClientMessage, Cursor, ErrorCode, HashIndex, IgnoreSet, JobState, ServerMessage,
    SessionEnv, SessionFailure, Transport, TransportError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::jobs::{Job, JobHost, Resolution, SpawnRequest};

static INCOMING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    ListedJobs,
    Synced,
    /// Streamed a job to its end.
    Completed(JobState),
    /// The client went away; the job keeps running.
    Detached,
    /// A failure was reported to the client.
    Rejected(ErrorCode),
    /// The client closed before the protocol finished.
    Disconnected,
}

pub struct SessionDriver<T: Transport> {
    transport: T,
    host: Arc<JobHost>,
    idle_check: Duration,
    peer: String,
}

impl<T: Transport> SessionDriver<T> {
    pub fn new(transport: T, host: Arc<JobHost>, idle_check: Duration, peer: impl Into<String>) -> Self {
        Self {
            transport,
            host,
            idle_check,
            peer: peer.into(),
        }
    }

    /// Serve the session to completion and close the connection.
    pub fn run(mut self) -> Result<SessionOutcome, TransportError> {
        let result = self.drive();
        self.transport.close();
        match &result {
            Ok(outcome) => debug!(peer = %self.peer, ?outcome, "Session ended"),
            Err(e) => warn!(peer = %self.peer, error = %e, "Session aborted"),
        }
        result
    }

    fn drive(&mut self) -> Result<SessionOutcome, TransportError> {
        let Some(first) = self.transport.recv::<ClientMessage>()? else {
            return Ok(SessionOutcome::Disconnected);
        };
        match first {
            ClientMessage::ListJobs => {
                let jobs = self.host.list();
                self.transport.send(&ServerMessage::Jobs { jobs })?;
                Ok(SessionOutcome::ListedJobs)
            }
            ClientMessage::Hello { project, env } => match env.reconnect.clone() {
                Some(reference) => self.reattach(&reference, env.kill),
                None => self.fresh(&project, env),
            },
            other => self.unexpected("hello", &other),
        }
    }

    fn reject(&mut self, failure: SessionFailure) -> Result<SessionOutcome, TransportError> {
        warn!(peer = %self.peer, code = %failure.code.code_string(), "{}", failure.message);
        let code = failure.code;
        self.transport.send(&ServerMessage::Failure(failure))?;
        Ok(SessionOutcome::Rejected(code))
    }

    fn unexpected(&mut self, expected: &str, got: &ClientMessage) -> Result<SessionOutcome, TransportError> {
        self.reject(SessionFailure::new(
            ErrorCode::SessionProtocolViolation,
            format!("expected {expected}, got {}", got.kind()),
        ))
    }

    fn reattach(&mut self, reference: &str, kill: bool) -> Result<SessionOutcome, TransportError> {
        match self.host.resolve(reference) {
            Resolution::Live(job) => {
                info!(peer = %self.peer, job_id = %job.id(), state = %job.state(), kill, "Reattached");
                if kill && let Err(e) = self.host.kill(&job) {
                    return self.reject(SessionFailure::new(ErrorCode::ProcessKillFailed, e.to_string()));
                }
                self.stream(&job)
            }
            Resolution::Finished(job) => {
                info!(peer = %self.peer, job_id = %job.id(), "Replaying finished job");
                self.stream(&job)
            }
            Resolution::Ambiguous(ids) => self.reject(
                SessionFailure::new(
                    ErrorCode::SessionAmbiguousJob,
                    format!("{} running jobs match '{reference}'", ids.len()),
                )
                .with_jobs(ids),
            ),
            Resolution::Unknown(ids) => self.reject(
                SessionFailure::new(ErrorCode::SessionUnknownJob, format!("no job matches '{reference}'"))
                    .with_jobs(ids),
            ),
        }
    }

    fn fresh(&mut self, project: &str, env: SessionEnv) -> Result<SessionOutcome, TransportError> {
        let project = sanitize_project_name(project);
        let root = self.host.home().join(&project);
        info!(peer = %self.peer, project = %project, mode = %env.mode, "New session");

        if let Err(e) = fs::create_dir_all(&root) {
            return self.reject(SessionFailure::new(
                ErrorCode::InternalDaemonError,
                format!("cannot create {}: {e}", root.display()),
            ));
        }
        let index = match HashIndex::load_or_build(&root, &IgnoreSet::with_defaults()) {
            Ok(index) => index,
            Err(e) => return self.reject(SessionFailure::new(ErrorCode::TransferIndexFailed, e.to_string())),
        };
        self.transport.send(&ServerMessage::HashIndex { index })?;

        let (archive, deleted) = match self.transport.recv::<ClientMessage>()? {
            None => return Ok(SessionOutcome::Disconnected),
            Some(ClientMessage::Patch { archive, deleted }) => (archive, deleted),
            Some(other) => return self.unexpected("patch", &other),
        };
        let (changed, removed) = match self.apply_patch(&root, archive.as_deref(), &deleted) {
            Ok(counts) => counts,
            Err(e) => return self.reject(SessionFailure::new(e.code(), e.to_string())),
        };

        match self.transport.recv::<ClientMessage>()? {
            None => Ok(SessionOutcome::Disconnected),
            Some(ClientMessage::SyncOnly) => {
                self.transport.send(&ServerMessage::Synced {
                    changed,
                    deleted: removed,
                })?;
                Ok(SessionOutcome::Synced)
            }
            Some(ClientMessage::Run { argv }) => self.start(project, env, root, argv),
            Some(other) => self.unexpected("run or sync_only", &other),
        }
    }

    /// Validate the whole archive, remove deletions, then extract.
    fn apply_patch(&self, root: &Path, archive: Option<&str>, deleted: &[String]) -> Result<(usize, usize), PatchError> {
        let incoming = match archive {
            Some(payload) => {
                let incoming = IncomingArchive::new(self.host.home());
                patch::decode_archive(payload, &incoming.0)?;
                let entries = patch::archive_entries(&incoming.0)?;
                debug!(entries = entries.len(), "Received patch archive");
                Some(incoming)
            }
            None => None,
        };
        let removed = patch::apply_deletions(root, deleted)?;
        let changed = match &incoming {
            Some(incoming) => patch::apply(&incoming.0, root)?,
            None => 0,
        };
        Ok((changed, removed))
    }

    fn start(
        &mut self,
        project: String,
        env: SessionEnv,
        workdir: PathBuf,
        argv: Vec<String>,
    ) -> Result<SessionOutcome, TransportError> {
        let name = if env.name.trim().is_empty() {
            "job".to_string()
        } else {
            sanitize_project_name(&env.name)
        };
        let request = SpawnRequest {
            project,
            name,
            argv,
            workdir,
            gpu: env.gpu,
        };
        let job = match self.host.spawn(request) {
            Ok(job) => job,
            Err(e) => return self.reject(SessionFailure::new(ErrorCode::ProcessSpawnFailed, e.to_string())),
        };
        debug!(peer = %self.peer, job_id = %job.id(), gpu = ?job.gpu(), "Streaming new job");
        self.stream(&job)
    }

    /// Forward output from a fresh cursor until the job ends or the client
    /// stops listening.
    fn stream(&mut self, job: &Job) -> Result<SessionOutcome, TransportError> {
        self.transport.send(&ServerMessage::JobStarted {
            job_id: job.id().clone(),
        })?;

        let mut cursor = Cursor::default();
        loop {
            let read = job.output().read(&cursor);
            cursor = read.cursor;
            if !read.chunk.is_empty()
                && let Err(e) = self.transport.send(&ServerMessage::Output { chunk: read.chunk })
            {
                info!(peer = %self.peer, job_id = %job.id(), error = %e, "Client detached");
                return Ok(SessionOutcome::Detached);
            }
            if read.closed {
                let (state, exit_code) = job.outcome();
                self.transport.send(&ServerMessage::Finished {
                    job_id: job.id().clone(),
                    state,
                    exit_code,
                })?;
                return Ok(SessionOutcome::Completed(state));
            }
            if !job.output().wait_for_change(&cursor, self.idle_check) && !self.transport.is_alive() {
                info!(peer = %self.peer, job_id = %job.id(), "Client detached");
                return Ok(SessionOutcome::Detached);
            }
        }
    }
}

/// Received archive on disk, removed when dropped.
struct IncomingArchive(PathBuf);

impl IncomingArchive {
    fn new(dir: &Path) -> Self {
        let seq = INCOMING_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(dir.join(format!(".incoming-{}-{seq}.{ARCHIVE_EXTENSION}", std::process::id())))
    }
}

impl Drop for IncomingArchive {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}
