//! Source tracking for configuration values.

use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Environment variable.
    Environment,
    /// Command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable or flag name, when not a default.
    pub origin: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            origin: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            origin: Some(var.into()),
        }
    }

    pub fn from_cli(value: T, flag: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::CommandLine,
            origin: Some(flag.into()),
        }
    }

    /// Replace the value with a command-line override when one was given.
    pub fn overridden_by(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => Self::from_cli(value, flag),
            None => self,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            origin: self.origin,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// `"environment (RMX_HOME)"` style description for logs.
    pub fn describe_source(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{} ({origin})", self.source),
            None => self.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_replaces_value_and_source() {
        let base = Sourced::from_env(1, "RMX_X");
        let over = base.clone().overridden_by("--x", Some(2));
        assert_eq!(over.value, 2);
        assert_eq!(over.source, ConfigSource::CommandLine);
        assert_eq!(base.overridden_by("--x", None).value, 1);
    }

    #[test]
    fn test_describe_source() {
        assert_eq!(Sourced::default_value(0).describe_source(), "default");
        assert_eq!(
            Sourced::from_env(0, "RMX_PORT").describe_source(),
            "environment (RMX_PORT)"
        );
    }
}
