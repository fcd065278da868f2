//! Ignore rules for tree walking.
//!
//! A rule is matched against a single file or directory *name*, never a path.
//! Patterns support one wildcard marker (`*`) at either end:
//!
//! | Pattern   | Strategy | Matches                         |
//! |-----------|----------|---------------------------------|
//! | `target`  | exact    | `target`                        |
//! | `tmp*`    | prefix   | `tmp`, `tmp_1`                  |
//! | `*.pyc`   | suffix   | `a.pyc`                         |
//! | `*cache*` | affix    | names starting or ending `cache`|
//!
//! Rules come from [`DEFAULT_IGNORES`], from the caller, and from
//! `.syncignore` files; a `.syncignore` applies to its own directory and below.

use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::hash_index::MANIFEST_NAME;

/// Per-directory ignore file name.
pub const SYNCIGNORE_FILE: &str = ".syncignore";

/// Names that are never synced.
pub const DEFAULT_IGNORES: &[&str] = &[
    "__pycache__",
    "*.pyc",
    ".ipynb_checkpoints",
    ".git",
    ".svn",
    ".hg",
    ".DS_Store",
    "*.egg-info",
    "target",
    MANIFEST_NAME,
];

const WILDCARD: char = '*';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IgnoreError {
    #[error("malformed ignore pattern '{pattern}': {reason}")]
    Malformed { pattern: String, reason: &'static str },
}

/// One parsed ignore pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreRule {
    Exact(String),
    Prefix(String),
    Suffix(String),
    /// Wildcard on both ends: matches a name starting or ending with the stem.
    Affix(String),
}

impl IgnoreRule {
    /// Parse a raw pattern. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self, IgnoreError> {
        let pattern = raw.trim();
        let malformed = |reason| IgnoreError::Malformed {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(malformed("empty pattern"));
        }
        if pattern.contains('/') || pattern.contains('\\') {
            return Err(malformed("patterns match names, not paths"));
        }

        let leading = pattern.starts_with(WILDCARD);
        let trailing = pattern.len() > 1 && pattern.ends_with(WILDCARD);
        let stem = pattern.trim_start_matches(WILDCARD).trim_end_matches(WILDCARD);
        if stem.contains(WILDCARD) {
            return Err(malformed("wildcard is only allowed at either end"));
        }

        let stem = stem.to_string();
        Ok(match (leading, trailing) {
            (false, false) => Self::Exact(stem),
            (false, true) => Self::Prefix(stem),
            (true, false) => Self::Suffix(stem),
            (true, true) => Self::Affix(stem),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(s) => name == s,
            Self::Prefix(s) => name.starts_with(s.as_str()),
            Self::Suffix(s) => name.ends_with(s.as_str()),
            Self::Affix(s) => name.starts_with(s.as_str()) || name.ends_with(s.as_str()),
        }
    }
}

/// The set of rules active for one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    rules: Vec<IgnoreRule>,
}

impl IgnoreSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in defaults.
    pub fn with_defaults() -> Self {
        let rules = DEFAULT_IGNORES
            .iter()
            .filter_map(|p| IgnoreRule::parse(p).ok())
            .collect();
        Self { rules }
    }

    /// Built-in defaults plus caller-supplied global patterns.
    pub fn with_patterns<I, S>(patterns: I) -> Result<Self, IgnoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::with_defaults();
        for pattern in patterns {
            set.rules.push(IgnoreRule::parse(pattern.as_ref())?);
        }
        Ok(set)
    }

    pub fn rules(&self) -> &[IgnoreRule] {
        &self.rules
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(name))
    }

    /// Whether a directory entry named `name` is pruned from a walk.
    /// Hidden directories are always pruned.
    pub fn prunes_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.is_ignored(name)
    }

    /// Rules effective inside `dir`: this set plus the directory's own
    /// `.syncignore`, if any.
    ///
    /// An unreadable `.syncignore` contributes nothing and is logged; a
    /// malformed pattern inside it is an error.
    pub fn scoped_to(&self, dir: &Path) -> Result<Self, IgnoreError> {
        let path = dir.join(SYNCIGNORE_FILE);
        if !path.is_file() {
            return Ok(self.clone());
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable ignore file");
                return Ok(self.clone());
            }
        };

        let mut scoped = self.clone();
        for pattern in parse_ignore_content(&content) {
            scoped.rules.push(IgnoreRule::parse(pattern)?);
        }
        Ok(scoped)
    }
}

/// Split ignore-file content into patterns, skipping blanks and `#` comments.
pub fn parse_ignore_content(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}
