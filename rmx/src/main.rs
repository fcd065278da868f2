//! RMX client.
//!
//! Mirrors the local project to a job host, starts a job there and streams
//! its output back. Jobs outlive the client: Ctrl-C detaches, `rmx attach`
//! picks the stream up again.

mod client;
mod config;
mod launch;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmx_common::{ErrorCode, GpuMode, LogConfig, init_logging};
use std::path::{Path, PathBuf};
use std::time::Duration;

use client::{Client, format_jobs};
use config::ClientConfig;
use launch::Endpoint;

#[derive(Parser)]
#[command(name = "rmx")]
#[command(author, version, about = "Run a local project on a remote job host")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the project and run a command on the host
    Run {
        /// HOST or HOST:PORT
        host: String,

        /// Job name (defaults to the target's file stem)
        #[arg(long)]
        name: Option<String>,

        /// GPU binding: all, or schedule to wait for a free GPU
        #[arg(long, default_value = "all")]
        gpu: GpuMode,

        /// Project directory to mirror
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Script, `-m module`, or any command, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Follow a running or finished job
    Attach {
        host: String,

        /// Job id, or a suffix of a running job's name
        job: String,

        /// Terminate the job instead of just watching it
        #[arg(long)]
        kill: bool,
    },

    /// List jobs on the host
    Jobs { host: String },

    /// Mirror the project without running anything
    Sync {
        host: String,

        #[arg(long)]
        dir: Option<PathBuf>,

        /// Keep syncing every SECS seconds
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let guards = init_logging(&log_config)?;

    let code = dispatch(cli.command).await?;
    drop(guards);
    std::process::exit(code);
}

async fn dispatch(command: Commands) -> Result<i32> {
    let config = ClientConfig::from_env()?;
    let client = |host: &str| -> Result<Client> {
        let endpoint = Endpoint::parse(host, config.port.value)
            .with_context(|| ErrorCode::ConfigInvalidHost.entry().format_brief())?;
        Ok(Client::new(endpoint, config.connect_timeout, config.ignore_set()?))
    };

    match command {
        Commands::Run {
            host,
            name,
            gpu,
            dir,
            command,
        } => {
            let dir = project_dir(dir.as_deref())?;
            client(&host)?.run(&dir, name, gpu, &command).await
        }
        Commands::Attach { host, job, kill } => client(&host)?.attach(&job, kill).await,
        Commands::Jobs { host } => {
            let jobs = client(&host)?.jobs().await?;
            print!("{}", format_jobs(&jobs));
            Ok(0)
        }
        Commands::Sync { host, dir, watch } => {
            let dir = project_dir(dir.as_deref())?;
            let client = client(&host)?;
            match watch {
                Some(secs) => {
                    eprintln!("rmx: watching {} every {secs}s (Ctrl-C to stop)", dir.display());
                    client.watch(&dir, Duration::from_secs(secs.max(1))).await?;
                }
                None => {
                    let report = client.sync(&dir).await?;
                    eprintln!(
                        "rmx: synced {} file(s), removed {} ({} tracked)",
                        report.changed,
                        report.deleted,
                        report.index.len()
                    );
                }
            }
            Ok(0)
        }
    }
}

/// Absolute project directory, so its name is always known.
fn project_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = dir.unwrap_or(Path::new("."));
    std::fs::canonicalize(dir).with_context(|| format!("Project directory {} not found", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_hyphenated_command() {
        let cli = Cli::try_parse_from(["rmx", "run", "gpu-box", "--gpu", "schedule", "-m", "pkg.train", "--lr", "0.1"])
            .unwrap();
        let Commands::Run { host, gpu, command, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(host, "gpu-box");
        assert_eq!(gpu, GpuMode::Schedule);
        assert_eq!(command, vec!["-m", "pkg.train", "--lr", "0.1"]);
    }

    #[test]
    fn test_attach_and_sync_flags() {
        let cli = Cli::try_parse_from(["rmx", "attach", "box:9000", "3-train", "--kill"]).unwrap();
        assert!(matches!(cli.command, Commands::Attach { kill: true, .. }));

        let cli = Cli::try_parse_from(["rmx", "sync", "box", "--watch", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { watch: Some(5), .. }));
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["rmx", "run", "box"]).is_err());
        assert!(Cli::try_parse_from(["rmx", "run", "box", "--gpu", "some", "x.py"]).is_err());
    }

    #[test]
    fn test_project_dir_is_absolute() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = project_dir(Some(tmp.path())).unwrap();
        assert!(dir.is_absolute());
        assert!(project_dir(Some(Path::new("/nonexistent/rmx-dir"))).is_err());
    }
}
