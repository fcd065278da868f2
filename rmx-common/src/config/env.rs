//! Environment variable parsing with type safety.
//!
//! Errors are collected rather than returned one at a time so a misconfigured
//! host reports every bad variable at startup.

use super::source::Sourced;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Reads `RMX_*` variables, recording every malformed one.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "RMX_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and its value, if set to valid unicode.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var = format!("{}{name}", self.prefix);
        let value = env::var(&var).ok();
        (var, value)
    }

    fn invalid(&mut self, var: &str, expected: &str, value: impl Into<String>) {
        self.errors.push(EnvError::InvalidValue {
            var: var.to_string(),
            expected: expected.to_string(),
            value: value.into(),
        });
    }

    /// An integer within `min..=max`. Out-of-range input keeps the default.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let (var, raw) = self.lookup(name);
        let Some(raw) = raw else {
            return Sourced::default_value(default);
        };
        let Ok(n) = raw.trim().parse::<u64>() else {
            self.invalid(&var, "unsigned 64-bit integer", raw);
            return Sourced::default_value(default);
        };
        if !(min..=max).contains(&n) {
            self.errors.push(EnvError::OutOfRange {
                var: var.clone(),
                value: n.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
            return Sourced::from_env(default, var);
        }
        Sourced::from_env(n, var)
    }

    /// A TCP port. Zero is rejected.
    pub fn get_port(&mut self, name: &str, default: u16) -> Sourced<u16> {
        self.get_u64_range(name, u64::from(default), 1, u64::from(u16::MAX))
            .map(|port| u16::try_from(port).unwrap_or(default))
    }

    /// Any `FromStr` value; `expected` describes the format in errors.
    pub fn get_parsed<T: FromStr>(&mut self, name: &str, default: T, expected: &str) -> Sourced<T> {
        let (var, raw) = self.lookup(name);
        match raw.map(|raw| (raw.trim().parse::<T>(), raw)) {
            None => Sourced::default_value(default),
            Some((Ok(parsed), _)) => Sourced::from_env(parsed, var),
            Some((Err(_), raw)) => {
                self.invalid(&var, expected, raw);
                Sourced::default_value(default)
            }
        }
    }

    /// A path, with a leading `~/` expanded. Empty counts as unset.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        match self.lookup(name) {
            (var, Some(raw)) if !raw.is_empty() => Sourced::from_env(expand_home(&raw), var),
            _ => Sourced::default_value(expand_home(default)),
        }
    }

    /// A tracing level name, lowercased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, raw) = self.lookup(name);
        let Some(raw) = raw else {
            return Sourced::default_value(default.to_string());
        };
        let level = raw.to_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            return Sourced::from_env(level, var);
        }
        self.errors.push(EnvError::InvalidLogLevel {
            var: var.clone(),
            value: raw,
        });
        Sourced::from_env(default.to_string(), var)
    }

    /// Comma-separated strings; blank items are dropped.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        match self.lookup(name) {
            (var, Some(raw)) => Sourced::from_env(split_list(&raw), var),
            (_, None) => Sourced::default_value(default),
        }
    }

    /// Comma-separated ids. Invalid items are reported and skipped.
    pub fn get_u32_list(&mut self, name: &str) -> Sourced<Vec<u32>> {
        let (var, raw) = self.lookup(name);
        let Some(raw) = raw else {
            return Sourced::default_value(Vec::new());
        };
        let mut ids = Vec::new();
        for item in split_list(&raw) {
            match item.parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => self.invalid(&var, "comma-separated unsigned integers", item),
            }
        }
        Sourced::from_env(ids, var)
    }

    /// `None` when unset or empty.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (_, None) => Sourced::default_value(None),
            (var, Some(raw)) => Sourced::from_env(Some(raw).filter(|s| !s.is_empty()), var),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use crate::config::source::ConfigSource;
    use std::net::SocketAddr;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_u64_range() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_IDLE"];
        cleanup_env(&vars);

        set_env("RMX_TEST_IDLE", "500");
        let mut parser = EnvParser::new();
        let result = parser.get_u64_range("TEST_IDLE", 1000, 50, 60_000);
        assert_eq!(result.value, 500);
        assert_eq!(result.source, ConfigSource::Environment);

        set_env("RMX_TEST_IDLE", "10");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_IDLE", 1000, 50, 60_000).value, 1000);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        set_env("RMX_TEST_IDLE", "soon");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_IDLE", 1000, 50, 60_000).value, 1000);
        assert!(matches!(parser.errors()[0], EnvError::InvalidValue { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_port_rejects_zero_and_overflow() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_PORT"];
        cleanup_env(&vars);

        set_env("RMX_TEST_PORT", "0");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_port("TEST_PORT", 24454).value, 24454);
        assert!(parser.has_errors());

        set_env("RMX_TEST_PORT", "70000");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_port("TEST_PORT", 24454).value, 24454);
        assert!(parser.has_errors());

        set_env("RMX_TEST_PORT", "9000");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_port("TEST_PORT", 24454).value, 9000);
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_parsed_socket_addr() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_LISTEN"];
        cleanup_env(&vars);

        let default: SocketAddr = "0.0.0.0:24454".parse().unwrap();
        let mut parser = EnvParser::new();
        let result = parser.get_parsed("TEST_LISTEN", default, "ADDR:PORT");
        assert_eq!(result.value, default);
        assert_eq!(result.source, ConfigSource::Default);

        set_env("RMX_TEST_LISTEN", "localhost");
        let mut parser = EnvParser::new();
        parser.get_parsed("TEST_LISTEN", default, "ADDR:PORT");
        assert_eq!(
            parser.take_errors(),
            vec![EnvError::InvalidValue {
                var: "RMX_TEST_LISTEN".into(),
                expected: "ADDR:PORT".into(),
                value: "localhost".into(),
            }]
        );

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_log_level() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_LEVEL"];
        cleanup_env(&vars);

        set_env("RMX_TEST_LEVEL", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info").value, "debug");

        set_env("RMX_TEST_LEVEL", "loud");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info").value, "info");
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_lists() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_GPUS", "RMX_TEST_IGNORE"];
        cleanup_env(&vars);

        set_env("RMX_TEST_GPUS", "0, 1,x,3");
        set_env("RMX_TEST_IGNORE", "*.log, data ,");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u32_list("TEST_GPUS").value, vec![0, 1, 3]);
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(
            parser.get_string_list("TEST_IGNORE", Vec::new()).value,
            vec!["*.log".to_string(), "data".to_string()]
        );

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_expands_home() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_HOME"];
        cleanup_env(&vars);

        set_env("RMX_TEST_HOME", "/srv/rmx");
        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_HOME", "~/.rmx/projects");
        assert_eq!(result.value, PathBuf::from("/srv/rmx"));

        cleanup_env(&vars);
        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_HOME", "~/.rmx/projects");
        assert_eq!(result.source, ConfigSource::Default);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result.value, home.join(".rmx/projects"));
        }
    }

    #[test]
    fn test_get_optional_string() {
        let _guard = env_test_lock();
        let vars = ["RMX_TEST_OPT"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_OPT").value, None);
        set_env("RMX_TEST_OPT", "");
        assert_eq!(parser.get_optional_string("TEST_OPT").value, None);
        set_env("RMX_TEST_OPT", "x.log");
        assert_eq!(parser.get_optional_string("TEST_OPT").value.as_deref(), Some("x.log"));

        cleanup_env(&vars);
    }
}
