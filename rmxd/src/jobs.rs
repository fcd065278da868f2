//! Job host: the process table and one poller thread per running job.
//!
//! A job is in the live table from the moment its process is spawned until
//! its poller has seen end of output and reaped the process. It then moves
//! to the finished table, keeping its output for replay.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use rmx_common::util::mask_sensitive_args;
use rmx_common::{GpuMode, JobId, JobState, JobSummary};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, PipeReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gpu::{GpuAllocator, GpuLease};
use crate::output::SharedOutput;

/// Environment variable carrying the job's declared name.
pub const JOB_NAME_ENV: &str = "RMX_JOB_NAME";

const READ_CHUNK: usize = 8 * 1024;
const REAP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no command given")]
    EmptyCommand,
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal job {id}: {source}")]
    Kill {
        id: JobId,
        #[source]
        source: io::Error,
    },
}

/// What a session asked the host to run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub project: String,
    pub name: String,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub gpu: GpuMode,
}

struct Process {
    child: Child,
    kill_requested: bool,
    outcome: Option<(JobState, Option<i32>)>,
    gpu: Option<GpuLease>,
}

pub struct Job {
    id: JobId,
    project: String,
    command: Vec<String>,
    started_at: DateTime<Utc>,
    gpu: Option<u32>,
    output: SharedOutput,
    process: Mutex<Process>,
}

impl Job {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn gpu(&self) -> Option<u32> {
        self.gpu
    }

    pub fn output(&self) -> &SharedOutput {
        &self.output
    }

    fn process(&self) -> MutexGuard<'_, Process> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `Running` until the poller has reaped the process.
    pub fn state(&self) -> JobState {
        self.outcome().0
    }

    pub fn outcome(&self) -> (JobState, Option<i32>) {
        self.process().outcome.unwrap_or((JobState::Running, None))
    }

    pub fn summary(&self) -> JobSummary {
        let (state, exit_code) = self.outcome();
        JobSummary {
            id: self.id.clone(),
            project: self.project.clone(),
            state,
            gpu: self.gpu,
            exit_code,
            started_at: self.started_at.to_rfc3339(),
            command: self.command.clone(),
        }
    }
}

/// How a reconnect reference resolved.
#[derive(Clone)]
pub enum Resolution {
    Live(Arc<Job>),
    Finished(Arc<Job>),
    Ambiguous(Vec<JobId>),
    Unknown(Vec<JobId>),
}

pub struct JobHost {
    home: PathBuf,
    gpus: Arc<GpuAllocator>,
    next_counter: AtomicU64,
    live: Mutex<HashMap<JobId, Arc<Job>>>,
    finished: Mutex<BTreeMap<u64, Arc<Job>>>,
}

impl JobHost {
    pub fn new(home: PathBuf, gpus: GpuAllocator) -> Self {
        Self {
            home,
            gpus: Arc::new(gpus),
            next_counter: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            finished: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn gpus(&self) -> &GpuAllocator {
        &self.gpus
    }

    fn live(&self) -> MutexGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finished(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Job>>> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a job and its poller.
    ///
    /// With [`GpuMode::Schedule`] this blocks until a GPU is free. The id is
    /// allocated only once the process exists, and the GPU goes back to the
    /// pool if spawning fails.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<Arc<Job>, JobError> {
        if request.argv.is_empty() {
            return Err(JobError::EmptyCommand);
        }

        let lease = match request.gpu {
            GpuMode::Schedule => {
                info!(name = %request.name, free = self.gpus.available(), "Waiting for a GPU");
                Some(self.gpus.lease())
            }
            GpuMode::All => None,
        };
        let gpu = lease.as_ref().map(GpuLease::id);

        let (child, reader) =
            start_process(&request, gpu).map_err(|source| JobError::Spawn {
                program: request.argv[0].clone(),
                source,
            })?;

        let counter = self.next_counter.fetch_add(1, Ordering::SeqCst);
        let id = JobId::compose(counter, &request.name);
        let job = Arc::new(Job {
            id: id.clone(),
            project: request.project,
            command: request.argv,
            started_at: Utc::now(),
            gpu,
            output: SharedOutput::new(),
            process: Mutex::new(Process {
                child,
                kill_requested: false,
                outcome: None,
                gpu: lease,
            }),
        });
        self.live().insert(id.clone(), Arc::clone(&job));

        let host = Arc::clone(self);
        let polled = Arc::clone(&job);
        let poller = thread::Builder::new()
            .name(format!("poll-{id}"))
            .spawn(move || host.poll(polled, reader, counter));
        if let Err(source) = poller {
            let _ = job.process().child.kill();
            self.live().remove(&id);
            return Err(JobError::Spawn {
                program: "poller thread".to_string(),
                source,
            });
        }

        info!(
            job_id = %id,
            gpu = ?gpu,
            command = %mask_sensitive_args(&job.command),
            "Job started"
        );
        Ok(job)
    }

    /// Feed process output into the job's buffer until end of stream, then
    /// reap the process and retire the job.
    fn poll(&self, job: Arc<Job>, mut reader: PipeReader, counter: u64) {
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => job.output.append_str(&decoder.decode(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Output read failed; treating as end of stream");
                    break;
                }
            }
        }
        job.output.append_str(&decoder.finish());
        drop(reader);

        let status = reap(&job);
        let lease = {
            let mut process = job.process();
            let state = if process.kill_requested {
                JobState::Killed
            } else {
                JobState::Finished
            };
            let code = status.and_then(|s| s.code());
            process.outcome = Some((state, code));
            process.gpu.take()
        };

        self.finished().insert(counter, Arc::clone(&job));
        self.live().remove(&job.id);
        drop(lease);
        job.output.close();

        let (state, code) = job.outcome();
        info!(job_id = %job.id, %state, exit_code = ?code, "Job ended");
    }

    /// Signal a running job, and everything it started, to terminate
    /// immediately.
    ///
    /// Each job leads its own process group, so the signal also reaches
    /// grandchildren holding the output pipe. The job stays in the live table
    /// until its poller sees the process go.
    pub fn kill(&self, job: &Job) -> Result<(), JobError> {
        let mut process = job.process();
        if process.outcome.is_some() {
            debug!(job_id = %job.id, "Kill requested for a job that already ended");
            return Ok(());
        }
        process.kill_requested = true;
        let group = Pid::from_raw(process.child.id() as i32);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => {
                info!(job_id = %job.id, pgid = %group, "Job killed");
                Ok(())
            }
            // Every member already exited; the poller reaps the leader.
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(JobError::Kill {
                id: job.id.clone(),
                source: io::Error::from(errno),
            }),
        }
    }

    /// Kill every live job. Used at shutdown.
    pub fn kill_all(&self) -> usize {
        let jobs: Vec<Arc<Job>> = self.live().values().cloned().collect();
        let mut killed = 0;
        for job in &jobs {
            match self.kill(job) {
                Ok(()) => killed += 1,
                Err(e) => warn!(error = %e, "Kill failed"),
            }
        }
        killed
    }

    /// Resolve a reconnect reference.
    ///
    /// An exact live id wins. A reference without the numeric counter prefix
    /// is matched as a suffix of the name part of live ids and must match
    /// exactly one. An exact id of a finished job resolves to it for replay.
    pub fn resolve(&self, reference: &str) -> Resolution {
        let live = self.live();
        let mut live_ids: Vec<JobId> = live.keys().cloned().collect();
        live_ids.sort_by_key(|id| counter_of(id));

        // Every name ends with the empty string.
        if reference.trim().is_empty() {
            return Resolution::Unknown(live_ids);
        }
        if let Some(job) = live.get(&JobId::new(reference)) {
            return Resolution::Live(Arc::clone(job));
        }

        if !JobId::has_counter_prefix(reference) {
            let candidates: Vec<&Arc<Job>> = live
                .values()
                .filter(|job| job.id.name_part().ends_with(reference))
                .collect();
            match candidates.as_slice() {
                [job] => return Resolution::Live(Arc::clone(job)),
                [] => {}
                many => {
                    let mut ids: Vec<JobId> = many.iter().map(|j| j.id.clone()).collect();
                    ids.sort_by_key(|id| counter_of(id));
                    return Resolution::Ambiguous(ids);
                }
            }
        }
        drop(live);

        let finished = self
            .finished()
            .values()
            .find(|job| job.id.as_str() == reference)
            .cloned();
        match finished {
            Some(job) => Resolution::Finished(job),
            None => Resolution::Unknown(live_ids),
        }
    }

    /// Live and finished jobs, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<Arc<Job>> = self.live().values().cloned().collect();
        jobs.extend(self.finished().values().cloned());
        jobs.sort_by_key(|job| counter_of(&job.id));
        jobs.dedup_by(|a, b| a.id == b.id);
        jobs.iter().map(|job| job.summary()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }
}

fn counter_of(id: &JobId) -> u64 {
    id.as_str()
        .split_once('-')
        .and_then(|(n, _)| n.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Spawn the job with stdout and stderr merged into one pipe, as the leader
/// of a new process group.
///
/// The `Command` (and its copies of the pipe's write end) is dropped before
/// returning so the reader sees end of stream when the process exits.
fn start_process(request: &SpawnRequest, gpu: Option<u32>) -> io::Result<(Child, PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let stderr = writer.try_clone()?;

    let mut command = Command::new(&request.argv[0]);
    command
        .args(&request.argv[1..])
        .current_dir(&request.workdir)
        .env(JOB_NAME_ENV, &request.name)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr)
        .process_group(0);
    if let Some(id) = gpu {
        command.env("CUDA_VISIBLE_DEVICES", id.to_string());
    }

    let child = command.spawn()?;
    Ok((child, reader))
}

/// Wait for the process without holding the job lock across the wait, so a
/// kill can still get in.
fn reap(job: &Job) -> Option<ExitStatus> {
    loop {
        match job.process().child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to collect exit status");
                return None;
            }
        }
        thread::sleep(REAP_POLL);
    }
}

/// Incremental UTF-8 decoding across read boundaries.
///
/// A multi-byte character split between two reads is held back until its
/// remaining bytes arrive; invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
