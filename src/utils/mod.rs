pub mod connection;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use which::which;

use crate::errors::{BackupError, Result};

/// Resolves the dump utility: an explicit path wins, otherwise `name` is looked up in PATH.
pub fn find_executable(explicit: Option<&Path>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => which(path).map_err(|e| {
            BackupError::capture(format!("{} is not an executable: {}", path.display(), e))
        }),
        None => which(name).map_err(|_| {
            BackupError::capture(format!(
                "{} executable not found in PATH. Please ensure the MongoDB database tools are installed and in your PATH.",
                name
            ))
        }),
    }
}

/// ISO-8601 UTC with `:` and `.` swapped for `-`, e.g. `2026-10-19T08-15-02-123Z`.
pub fn backup_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

pub fn artifact_file_name(timestamp: &str) -> String {
    format!("backup-{}.enc", timestamp)
}

pub fn temp_dump_file_name(timestamp: &str) -> String {
    format!("temp-dump-{}.gz", timestamp)
}

/// Hides `user:password@` in a connection string before it reaches a log line.
pub fn mask_credentials(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***:***@{}", &uri[..scheme_end], &rest[at + 1..]),
        None => uri.to_string(),
    }
}
