//! Logging setup shared by `rmx` and `rmxd`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::EnvParser;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Also append JSON lines to this file.
    pub file: Option<PathBuf>,
    /// Write human output to stderr (stdout stays free for job output).
    pub stderr: bool,
}

impl LogConfig {
    /// Read `RMX_LOG_LEVEL`, `RMX_LOG_FORMAT` and `RMX_LOG_FILE`.
    ///
    /// Bad values fall back to defaults; they are reported once logging is up.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).into_inner();
        let format = parser
            .get_parsed("LOG_FORMAT", LogFormat::Pretty, "pretty|json")
            .into_inner();
        let file = parser.get_optional_string("LOG_FILE").into_inner().map(PathBuf::from);
        for error in parser.take_errors() {
            eprintln!("warning: {error}");
        }
        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        // RUST_LOG wins when set, so ad hoc debugging needs no config change.
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            stderr: true,
        }
    }
}

/// Keeps background log writers alive; drop it only at exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LogGuards> {
    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .context("RMX_LOG_FILE must name a file")?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let use_stderr = config.stderr;
    let (pretty, json) = match config.format {
        LogFormat::Pretty => (
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_writer(move || -> Box<dyn std::io::Write> {
                        if use_stderr {
                            Box::new(std::io::stderr())
                        } else {
                            Box::new(std::io::stdout())
                        }
                    }),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(pretty)
        .with(json)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LogGuards { _file: file_guard })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_from_env_reads_variables() {
        let _guard = env_test_lock();
        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::set_var("RMX_LOG_LEVEL", "debug");
            std::env::set_var("RMX_LOG_FORMAT", "json");
            std::env::remove_var("RMX_LOG_FILE");
        }
        let config = LogConfig::from_env("info");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.file.is_none());
        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::remove_var("RMX_LOG_LEVEL");
            std::env::remove_var("RMX_LOG_FORMAT");
        }
    }

    #[test]
    fn test_builders_override() {
        let config = LogConfig::default()
            .with_level("trace")
            .with_format(LogFormat::Json)
            .with_stderr();
        assert_eq!(config.level, "trace");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.stderr);
    }
}
