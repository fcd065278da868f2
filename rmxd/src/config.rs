//! Daemon configuration: environment first, command line on top.

use anyhow::{Result, bail};
use rmx_common::config::{EnvParser, Sourced};
use rmx_common::{DEFAULT_PORT, ErrorCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_HOME: &str = "~/.rmx/projects";
pub const DEFAULT_IDLE_CHECK_MS: u64 = 1000;

/// Command-line values that override the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub home: Option<PathBuf>,
    pub gpus: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root under which each project gets its own mirror directory.
    pub home: Sourced<PathBuf>,
    pub listen: Sourced<SocketAddr>,
    /// GPU ids jobs may be scheduled onto.
    pub gpus: Sourced<Vec<u32>>,
    /// How often an idle streaming session checks that its client is still there.
    pub idle_check: Sourced<Duration>,
}

impl DaemonConfig {
    pub fn load(overrides: Overrides) -> Result<Self> {
        let mut env = EnvParser::new();
        let home = env.get_path("HOME", DEFAULT_HOME);
        let listen = env.get_parsed(
            "LISTEN",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            "socket address (host:port)",
        );
        let gpus = env.get_u32_list("GPUS");
        let idle = env.get_u64_range("IDLE_CHECK_MS", DEFAULT_IDLE_CHECK_MS, 50, 60_000);

        if env.has_errors() {
            let errors = env.take_errors();
            for e in &errors {
                warn!(code = %ErrorCode::ConfigEnvError.code_string(), "{e}");
            }
            let first = &errors[0];
            bail!(
                "[{}] {} ({} invalid environment value(s), first: {first})",
                ErrorCode::ConfigEnvError.code_string(),
                ErrorCode::ConfigEnvError.message(),
                errors.len()
            );
        }

        let config = Self {
            home: home.overridden_by("--home", overrides.home),
            listen: listen.overridden_by("--listen", overrides.listen),
            gpus: gpus.overridden_by("--gpus", overrides.gpus),
            idle_check: Sourced {
                value: Duration::from_millis(idle.value),
                source: idle.source,
                origin: idle.origin,
            },
        };
        debug!(
            home = %config.home.describe_source(),
            listen = %config.listen.describe_source(),
            gpus = %config.gpus.describe_source(),
            "Configuration resolved"
        );
        Ok(config)
    }
}
