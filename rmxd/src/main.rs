//! RMX job host daemon.
//!
//! Accepts client sessions over TCP, mirrors each client project under its
//! home directory, runs jobs and streams their output. Sessions, job pollers
//! and GPU waits are plain OS threads; tokio only drives the accept loop and
//! signal handling.

mod config;
mod gpu;
mod jobs;
mod output;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use rmx_common::transport::MessageStream;
use rmx_common::{ErrorCode, LogConfig, init_logging};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use config::{DaemonConfig, Overrides};
use gpu::GpuAllocator;
use jobs::JobHost;
use session::SessionDriver;

#[derive(Parser)]
#[command(name = "rmxd")]
#[command(author, version, about = "RMX job host - sync projects, run jobs, stream output")]
struct Cli {
    /// Address to listen on [env: RMX_LISTEN]
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directory holding project mirrors [env: RMX_HOME]
    #[arg(long)]
    home: Option<PathBuf>,

    /// GPU ids available for scheduling, comma separated [env: RMX_GPUS]
    #[arg(long, value_delimiter = ',')]
    gpus: Option<Vec<u32>>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    let config = DaemonConfig::load(Overrides {
        listen: cli.listen,
        home: cli.home,
        gpus: cli.gpus,
    })?;

    let home = config.home.value.clone();
    std::fs::create_dir_all(&home).with_context(|| {
        format!(
            "[{}] cannot create {}",
            ErrorCode::ConfigHomeUnavailable.code_string(),
            home.display()
        )
    })?;

    let gpus = GpuAllocator::new(config.gpus.value.iter().copied());
    let host = Arc::new(JobHost::new(home, gpus));
    info!(
        home = %host.home().display(),
        gpus = ?host.gpus().pool(),
        source = %config.gpus.describe_source(),
        "Starting RMX job host"
    );

    let listener = TcpListener::bind(config.listen.value).await.with_context(|| {
        format!(
            "[{}] cannot listen on {}",
            ErrorCode::ConfigInvalidListen.code_string(),
            config.listen.value
        )
    })?;
    info!(addr = %config.listen.value, "Listening");

    let idle_check = config.idle_check.value;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = start_session(stream, peer, &host, idle_check) {
                        warn!(%peer, error = %e, "Failed to start session");
                    }
                }
                Err(e) => warn!(error = %e, "Accept error"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let killed = host.kill_all();
    info!(killed, "Stopping live jobs");
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while host.live_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if host.live_count() > 0 {
        warn!(remaining = host.live_count(), "Jobs still running at exit");
    }
    Ok(())
}

/// Hand an accepted connection to its own session thread.
fn start_session(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    host: &Arc<JobHost>,
    idle_check: Duration,
) -> Result<()> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let transport = MessageStream::new(stream)?;

    let host = Arc::clone(host);
    std::thread::Builder::new()
        .name(format!("session-{peer}"))
        .spawn(move || {
            debug!(%peer, "Session started");
            // Failures are logged by the driver.
            let _ = SessionDriver::new(transport, host, idle_check, peer.to_string()).run();
        })
        .context("failed to spawn session thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_gpu_list() {
        let cli = Cli::try_parse_from(["rmxd", "--gpus", "0,2", "--listen", "127.0.0.1:7000", "-v"]).unwrap();
        assert_eq!(cli.gpus, Some(vec![0, 2]));
        assert_eq!(cli.listen.unwrap().port(), 7000);
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_defaults_defer_to_environment() {
        let cli = Cli::try_parse_from(["rmxd"]).unwrap();
        assert!(cli.listen.is_none());
        assert!(cli.home.is_none());
        assert!(cli.gpus.is_none());
    }
}
