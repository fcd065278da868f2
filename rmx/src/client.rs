//! Client side of the session protocol.

use anyhow::{Context, Result, anyhow, bail};
use rmx_common::patch::{self, PackOutcome};
use rmx_common::util::project_name_from_path;
use rmx_common::{
    ClientMessage, ErrorCode, GpuMode, HashIndex, IgnoreSet, JobState, JobSummary, ServerMessage,
    SessionEnv,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::launch::{Endpoint, Launch};

/// One JSON-lines session with a job host.
struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self> {
        let address = endpoint.address();
        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                anyhow!(
                    "Connecting to {address} timed out after {}s",
                    connect_timeout.as_secs()
                )
            })?
            .with_context(|| format!("Cannot connect to job host at {address}"))?;
        stream.set_nodelay(true)?;
        debug!(%address, "Connected");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let mut line = serde_json::to_string(message).with_context(|| {
            format!(
                "[{}] cannot encode {}",
                ErrorCode::InternalSerializationError.code_string(),
                message.kind()
            )
        })?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next message; a `Failure` from the host becomes an error.
    async fn recv(&mut self) -> Result<ServerMessage> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message: ServerMessage =
                serde_json::from_str(&line).context("Malformed message from job host")?;
            return match message {
                ServerMessage::Failure(failure) => Err(failure.into()),
                message => Ok(message),
            };
        }
        bail!(
            "[{}] {}",
            ErrorCode::SessionConnectionLost.code_string(),
            ErrorCode::SessionConnectionLost.message()
        )
    }
}

fn unexpected(expected: &str, got: &ServerMessage) -> anyhow::Error {
    anyhow!(
        "[{}] expected {expected} from job host, got {}",
        ErrorCode::SessionProtocolViolation.code_string(),
        got.kind()
    )
}

/// Process exit status mirroring a finished job.
pub fn exit_status(state: JobState, exit_code: Option<i32>) -> i32 {
    match (state, exit_code) {
        (JobState::Finished, Some(code)) => code,
        (JobState::Killed, _) => 128 + 9,
        _ => 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// What the host holds after the patch.
    pub index: HashIndex,
    pub changed: usize,
    pub deleted: usize,
}

pub struct Client {
    endpoint: Endpoint,
    connect_timeout: Duration,
    ignore: IgnoreSet,
}

impl Client {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration, ignore: IgnoreSet) -> Self {
        Self {
            endpoint,
            connect_timeout,
            ignore,
        }
    }

    async fn connect(&self) -> Result<Connection> {
        Connection::open(&self.endpoint, self.connect_timeout).await
    }

    /// Open a session for `dir` and bring the host's copy up to date.
    async fn push_tree(&self, conn: &mut Connection, dir: &Path, env: SessionEnv) -> Result<PackOutcome> {
        let project = project_name_from_path(dir);
        conn.send(&ClientMessage::Hello {
            project: project.clone(),
            env,
        })
        .await?;
        let server = match conn.recv().await? {
            ServerMessage::HashIndex { index } => index,
            other => return Err(unexpected("hash_index", &other)),
        };

        let (outcome, archive) = pack_and_encode(dir.to_path_buf(), server, self.ignore.clone()).await?;
        info!(
            project = %project,
            noop = outcome.is_noop(),
            deleted = outcome.deleted.len(),
            payload_bytes = archive.as_ref().map_or(0, String::len),
            "Sending patch"
        );
        conn.send(&ClientMessage::Patch {
            archive,
            deleted: outcome.deleted.clone(),
        })
        .await?;
        Ok(outcome)
    }

    /// Sync `dir`, start `command` on the host and follow its output.
    pub async fn run(&self, dir: &Path, name: Option<String>, gpu: GpuMode, command: &[String]) -> Result<i32> {
        let launch = Launch::infer(command);
        let name = name.unwrap_or_else(|| Launch::default_name(command));
        let mut conn = self.connect().await?;
        self.push_tree(&mut conn, dir, SessionEnv::new_job(name, launch.mode, gpu))
            .await?;
        conn.send(&ClientMessage::Run { argv: launch.argv }).await?;
        self.follow(&mut conn).await
    }

    /// Follow (and optionally kill) an existing job.
    pub async fn attach(&self, job: &str, kill: bool) -> Result<i32> {
        let mut conn = self.connect().await?;
        conn.send(&ClientMessage::Hello {
            project: String::new(),
            env: SessionEnv::reattach(job, kill),
        })
        .await?;
        self.follow(&mut conn).await
    }

    /// Print job output until it finishes. Ctrl-C detaches and leaves the
    /// job running.
    async fn follow(&self, conn: &mut Connection) -> Result<i32> {
        let job_id = match conn.recv().await? {
            ServerMessage::JobStarted { job_id } => job_id,
            other => return Err(unexpected("job_started", &other)),
        };
        eprintln!("rmx: job {job_id} on {}", self.endpoint.address());

        let mut stdout = tokio::io::stdout();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                message = conn.recv() => match message? {
                    ServerMessage::Output { chunk } => {
                        stdout.write_all(chunk.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    ServerMessage::Finished { state, exit_code, .. } => {
                        eprintln!("rmx: job {job_id} {state} (exit code {})",
                            exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()));
                        return Ok(exit_status(state, exit_code));
                    }
                    other => return Err(unexpected("output", &other)),
                },
                _ = &mut ctrl_c => {
                    eprintln!(
                        "\nrmx: detached; {job_id} keeps running. Reattach with: rmx attach {} {job_id}",
                        self.endpoint.address()
                    );
                    return Ok(0);
                }
            }
        }
    }

    pub async fn jobs(&self) -> Result<Vec<JobSummary>> {
        let mut conn = self.connect().await?;
        conn.send(&ClientMessage::ListJobs).await?;
        match conn.recv().await? {
            ServerMessage::Jobs { jobs } => Ok(jobs),
            other => Err(unexpected("jobs", &other)),
        }
    }

    /// Mirror `dir` to the host without running anything.
    pub async fn sync(&self, dir: &Path) -> Result<SyncReport> {
        let mut conn = self.connect().await?;
        let outcome = self.push_tree(&mut conn, dir, SessionEnv::default()).await?;
        conn.send(&ClientMessage::SyncOnly).await?;
        match conn.recv().await? {
            ServerMessage::Synced { changed, deleted } => Ok(SyncReport {
                index: outcome.index,
                changed,
                deleted,
            }),
            other => Err(unexpected("synced", &other)),
        }
    }

    /// Sync every `every` until Ctrl-C.
    ///
    /// After a successful sync the returned index stands in for the host's
    /// state, so an unchanged tree costs a local walk and no connection.
    pub async fn watch(&self, dir: &Path, every: Duration) -> Result<()> {
        let mut known: Option<HashIndex> = None;
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }

            if let Some(known) = &known {
                let current = build_index(dir.to_path_buf(), self.ignore.clone()).await?;
                if current == *known {
                    debug!("Tree unchanged");
                    continue;
                }
            }
            match self.sync(dir).await {
                Ok(report) => {
                    if report.changed > 0 || report.deleted > 0 {
                        eprintln!(
                            "rmx: synced {} file(s), removed {}",
                            report.changed, report.deleted
                        );
                    }
                    known = Some(report.index);
                }
                Err(e) => {
                    warn!(error = %e, "Sync failed; retrying next interval");
                    known = None;
                }
            }
        }
    }
}

fn transfer_error(e: patch::PatchError) -> anyhow::Error {
    anyhow!("[{}] {e}", e.code().code_string())
}

/// Pack off the async runtime and read the archive into its wire form. The
/// local archive is removed once encoded.
async fn pack_and_encode(dir: PathBuf, server: HashIndex, ignore: IgnoreSet) -> Result<(PackOutcome, Option<String>)> {
    tokio::task::spawn_blocking(move || {
        let outcome = patch::pack(&dir, &server, &ignore).map_err(transfer_error)?;
        let archive = match &outcome.archive {
            Some(path) => {
                let encoded = patch::encode_archive(path).map_err(transfer_error);
                if let Err(e) = std::fs::remove_file(path) {
                    debug!(path = %path.display(), error = %e, "Could not remove local archive");
                }
                Some(encoded?)
            }
            None => None,
        };
        Ok::<_, anyhow::Error>((outcome, archive))
    })
    .await?
}

async fn build_index(dir: PathBuf, ignore: IgnoreSet) -> Result<HashIndex> {
    let index = tokio::task::spawn_blocking(move || HashIndex::build(&dir, &ignore)).await??;
    Ok(index)
}

/// Render job summaries as an aligned table.
pub fn format_jobs(jobs: &[JobSummary]) -> String {
    if jobs.is_empty() {
        return "No jobs.\n".to_string();
    }
    let rows: Vec<[String; 6]> = jobs
        .iter()
        .map(|job| {
            [
                job.id.to_string(),
                job.state.to_string(),
                job.gpu.map_or_else(|| "-".to_string(), |g| g.to_string()),
                job.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
                job.project.clone(),
                job.command.join(" "),
            ]
        })
        .collect();
    let header = ["ID", "STATE", "GPU", "EXIT", "PROJECT", "COMMAND"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };
    push_row(&header);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&cells);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_common::{JobId, MANIFEST_NAME, SessionFailure};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one session and answer each client message with `respond`.
    /// Returns everything the client sent.
    async fn fake_host<F>(respond: F) -> (Endpoint, JoinHandle<Vec<ClientMessage>>)
    where
        F: Fn(&ClientMessage) -> Vec<ServerMessage> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: ClientMessage = serde_json::from_str(&line).unwrap();
                let replies = respond(&message);
                for reply in &replies {
                    let mut json = serde_json::to_string(reply).unwrap();
                    json.push('\n');
                    writer.write_all(json.as_bytes()).await.unwrap();
                }
                let ends = matches!(
                    replies.last(),
                    Some(ServerMessage::Finished { .. } | ServerMessage::Synced { .. } | ServerMessage::Jobs { .. } | ServerMessage::Failure(_))
                );
                seen.push(message);
                if ends {
                    break;
                }
            }
            seen
        });
        (
            Endpoint {
                host: "127.0.0.1".into(),
                port,
            },
            handle,
        )
    }

    fn client(endpoint: Endpoint) -> Client {
        Client::new(endpoint, Duration::from_secs(5), IgnoreSet::with_defaults())
    }

    #[test]
    fn test_exit_status_mirrors_job() {
        assert_eq!(exit_status(JobState::Finished, Some(0)), 0);
        assert_eq!(exit_status(JobState::Finished, Some(3)), 3);
        assert_eq!(exit_status(JobState::Finished, None), 1);
        assert_eq!(exit_status(JobState::Killed, None), 137);
    }

    #[test]
    fn test_format_jobs() {
        let jobs = vec![JobSummary {
            id: JobId::new("1-train"),
            project: "net".into(),
            state: JobState::Running,
            gpu: Some(0),
            exit_code: None,
            started_at: "2026-01-01T00:00:00+00:00".into(),
            command: vec!["python".into(), "train.py".into()],
        }];
        let table = format_jobs(&jobs);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].starts_with("1-train"));
        assert!(lines[1].contains("running"));
        assert!(lines[1].ends_with("python train.py"));
        assert_eq!(format_jobs(&[]), "No jobs.\n");
    }

    #[tokio::test]
    async fn test_sync_sends_patch_for_new_files() {
        let local = TempDir::new().unwrap();
        std::fs::write(local.path().join("a.txt"), "alpha").unwrap();

        let (endpoint, host) = fake_host(|message| match message {
            ClientMessage::Hello { .. } => vec![ServerMessage::HashIndex {
                index: HashIndex::new(),
            }],
            ClientMessage::SyncOnly => vec![ServerMessage::Synced {
                changed: 2,
                deleted: 0,
            }],
            _ => vec![],
        })
        .await;

        let report = client(endpoint).sync(local.path()).await.unwrap();
        assert_eq!(report.changed, 2);
        assert!(report.index.contains("a.txt"));

        let seen = host.await.unwrap();
        assert_eq!(seen.len(), 3);
        let ClientMessage::Patch { archive: Some(payload), deleted } = &seen[1] else {
            panic!("expected a patch with an archive");
        };
        assert!(deleted.is_empty());

        let scratch = TempDir::new().unwrap();
        let path = scratch.path().join("p.tar.zst");
        patch::decode_archive(payload, &path).unwrap();
        let mut entries = patch::archive_entries(&path).unwrap();
        entries.sort();
        assert_eq!(entries, vec![MANIFEST_NAME.to_string(), "a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_run_streams_and_returns_exit_code() {
        let local = TempDir::new().unwrap();
        std::fs::write(local.path().join("train.py"), "print('hi')").unwrap();
        let current = HashIndex::build(local.path(), &IgnoreSet::with_defaults()).unwrap();

        let (endpoint, host) = fake_host(move |message| match message {
            ClientMessage::Hello { .. } => vec![ServerMessage::HashIndex {
                index: current.clone(),
            }],
            ClientMessage::Run { .. } => vec![
                ServerMessage::JobStarted {
                    job_id: JobId::new("1-train"),
                },
                ServerMessage::Output { chunk: "hi\n".into() },
                ServerMessage::Finished {
                    job_id: JobId::new("1-train"),
                    state: JobState::Finished,
                    exit_code: Some(3),
                },
            ],
            _ => vec![],
        })
        .await;

        let command = vec!["train.py".to_string(), "--fast".to_string()];
        let code = client(endpoint)
            .run(local.path(), None, GpuMode::Schedule, &command)
            .await
            .unwrap();
        assert_eq!(code, 3);

        let seen = host.await.unwrap();
        let ClientMessage::Hello { env, .. } = &seen[0] else {
            panic!("expected hello");
        };
        assert_eq!(env.name, "train");
        assert_eq!(env.gpu, GpuMode::Schedule);
        assert_eq!(
            seen[1],
            ClientMessage::Patch {
                archive: None,
                deleted: Vec::new()
            },
            "an unchanged tree sends an empty patch"
        );
        assert_eq!(
            seen[2],
            ClientMessage::Run {
                argv: vec!["python".into(), "train.py".into(), "--fast".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_attach_surfaces_failure() {
        let (endpoint, host) = fake_host(|message| match message {
            ClientMessage::Hello { .. } => vec![ServerMessage::Failure(
                SessionFailure::new(ErrorCode::SessionAmbiguousJob, "2 running jobs match 'train'")
                    .with_jobs(vec![JobId::new("1-train"), JobId::new("2-pretrain")]),
            )],
            _ => vec![],
        })
        .await;

        let err = client(endpoint).attach("train", false).await.unwrap_err();
        let failure = err.downcast_ref::<SessionFailure>().unwrap();
        assert_eq!(failure.code, ErrorCode::SessionAmbiguousJob);
        assert_eq!(failure.jobs.len(), 2);

        let seen = host.await.unwrap();
        let ClientMessage::Hello { env, .. } = &seen[0] else {
            panic!("expected hello");
        };
        assert_eq!(env.reconnect.as_deref(), Some("train"));
    }

    #[tokio::test]
    async fn test_jobs_lists_summaries() {
        let (endpoint, _host) = fake_host(|_| vec![ServerMessage::Jobs { jobs: Vec::new() }]).await;
        assert!(client(endpoint).jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(client(endpoint).jobs().await.is_err());
    }
}
