//! Shared utilities for RMX.

use std::path::Path;

/// Make a client-supplied project name safe to use as one directory under
/// the job host's home.
///
/// Separators, NULs and other unusual characters become `_`; leading dots
/// and dashes are stripped. Names that sanitize to nothing, or that try to
/// climb out with `..`, become `unknown`.
pub fn sanitize_project_name(name: &str) -> String {
    if name.is_empty() || name.contains("..") {
        return "unknown".to_string();
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = sanitized.trim_start_matches(['.', '-']);
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Project name for a local directory: its sanitized final component.
pub fn project_name_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    sanitize_project_name(name)
}

const SENSITIVE_KEYS: &[&str] = &[
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "API_KEY",
    "ACCESS_KEY",
    "PRIVATE_KEY",
];

const SENSITIVE_FLAGS: &[&str] = &["--token", "--password", "--api-key", "--secret"];

/// Render a job's argv for logs with credential-looking values masked.
///
/// Masks `KEY=value` arguments whose key contains a sensitive word, and the
/// value of `--token`-style flags in both `--flag value` and `--flag=value`
/// forms.
pub fn mask_sensitive_args(argv: &[String]) -> String {
    let mut masked = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    for arg in argv {
        if mask_next {
            masked.push("***".to_string());
            mask_next = false;
            continue;
        }
        if SENSITIVE_FLAGS.contains(&arg.as_str()) {
            mask_next = true;
            masked.push(arg.clone());
            continue;
        }
        if let Some((key, _)) = arg.split_once('=') {
            let upper = key.to_ascii_uppercase();
            let sensitive_flag = SENSITIVE_FLAGS.contains(&key);
            let sensitive_env = !key.starts_with('-')
                && SENSITIVE_KEYS.iter().any(|word| upper.contains(word));
            if sensitive_flag || sensitive_env {
                masked.push(format!("{key}=***"));
                continue;
            }
        }
        masked.push(arg.clone());
    }
    masked.join(" ")
}
