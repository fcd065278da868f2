//! Client settings from the environment.

use anyhow::{Result, bail};
use rmx_common::config::{EnvParser, Sourced};
use rmx_common::{DEFAULT_PORT, ErrorCode, IgnoreSet};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port used when a host is given without one.
    pub port: Sourced<u16>,
    /// Extra ignore patterns applied to every directory.
    pub ignore: Sourced<Vec<String>>,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let mut env = EnvParser::new();
        let port = env.get_port("PORT", DEFAULT_PORT);
        let ignore = env.get_string_list("IGNORE", Vec::new());
        let timeout = env.get_u64_range("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS, 1, 3600);

        let errors = env.take_errors();
        if let Some(first) = errors.first() {
            bail!(
                "[{}] {first}{}",
                ErrorCode::ConfigEnvError.code_string(),
                if errors.len() > 1 {
                    format!(" (and {} more)", errors.len() - 1)
                } else {
                    String::new()
                }
            );
        }

        Ok(Self {
            port,
            ignore,
            connect_timeout: Duration::from_secs(timeout.value),
        })
    }

    /// Default ignore rules plus `RMX_IGNORE`.
    pub fn ignore_set(&self) -> Result<IgnoreSet> {
        match IgnoreSet::with_patterns(&self.ignore.value) {
            Ok(set) => Ok(set),
            Err(e) => bail!(
                "[{}] {e} (from {})",
                ErrorCode::ConfigInvalidIgnorePattern.code_string(),
                self.ignore.describe_source()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_common::ConfigSource;

    fn config(ignore: &[&str]) -> ClientConfig {
        ClientConfig {
            port: Sourced::default_value(DEFAULT_PORT),
            ignore: Sourced::from_env(ignore.iter().map(|s| s.to_string()).collect(), "RMX_IGNORE"),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_ignore_set_extends_defaults() {
        let set = config(&["*.ckpt", "data"]).ignore_set().unwrap();
        assert!(set.is_ignored("model.ckpt"));
        assert!(set.is_ignored("data"));
        assert!(set.is_ignored("__pycache__"));
        assert!(!set.is_ignored("main.py"));
    }

    #[test]
    fn test_bad_ignore_pattern_reports_code() {
        let err = config(&["a*b"]).ignore_set().unwrap_err().to_string();
        assert!(err.contains("RMX-E005"), "{err}");
        assert!(err.contains("RMX_IGNORE"), "{err}");
    }

    #[test]
    fn test_sourced_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.port.source, ConfigSource::Default);
        assert_eq!(cfg.port.value, 24454);
    }
}
