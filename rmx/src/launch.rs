//! Turning command-line input into a host endpoint and a job command.

use rmx_common::LaunchMode;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("empty host")]
    Empty,
    #[error("'{0}': only one ':' may separate host and port")]
    TooManyColons(String),
    #[error("'{spec}': invalid port '{port}'")]
    InvalidPort { spec: String, port: String },
}

/// Where the job host listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `HOST` or `HOST:PORT`, using `default_port` for the former.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, HostError> {
        let spec = spec.trim();
        let (host, port) = match spec.split_once(':') {
            None => (spec, default_port),
            Some((_, rest)) if rest.contains(':') => {
                return Err(HostError::TooManyColons(spec.to_string()));
            }
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| HostError::InvalidPort {
                        spec: spec.to_string(),
                        port: port.to_string(),
                    })?;
                (host, port)
            }
        };
        if host.is_empty() {
            return Err(HostError::Empty);
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The command a job runs and how it was recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub argv: Vec<String>,
    pub mode: LaunchMode,
}

impl Launch {
    /// Pick an interpreter from the target's shape.
    ///
    /// `x.py` and `-m module` run under `python`, `x.sh` under `sh`, `x.js`
    /// under `nodejs`; anything else runs as given.
    pub fn infer(command: &[String]) -> Self {
        let Some(target) = command.first() else {
            return Self {
                argv: Vec::new(),
                mode: LaunchMode::Shell,
            };
        };
        let (interpreter, mode) = if target == "-m" || target.ends_with(".py") {
            (Some("python"), LaunchMode::Python)
        } else if target.ends_with(".sh") {
            (Some("sh"), LaunchMode::Shell)
        } else if target.ends_with(".js") {
            (Some("nodejs"), LaunchMode::Nodejs)
        } else {
            (None, LaunchMode::Shell)
        };

        let argv = interpreter
            .map(str::to_string)
            .into_iter()
            .chain(command.iter().cloned())
            .collect();
        Self { argv, mode }
    }

    /// Job name derived from the target: the file stem, or the module name.
    pub fn default_name(command: &[String]) -> String {
        let target = match command {
            [flag, module, ..] if flag == "-m" => module.as_str(),
            [target, ..] => target.as_str(),
            [] => return "job".to_string(),
        };
        let file = target.rsplit('/').next().unwrap_or(target);
        let stem = match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() && command[0] != "-m" => stem,
            _ => file,
        };
        if stem.is_empty() {
            "job".to_string()
        } else {
            stem.to_string()
        }
    }
}
