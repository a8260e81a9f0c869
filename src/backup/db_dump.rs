// vaultdump/src/backup/db_dump.rs
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::DEFAULT_DUMP_TOOL;
use crate::errors::{BackupError, Result};
use crate::utils::{find_executable, mask_credentials};

/// A dump that the tool reported as complete.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    pub dump_path: PathBuf,
}

/// The external dump utility, invoked as `<program> [leading args] --uri=<uri> --archive=<path> --gzip`.
#[derive(Debug, Clone)]
pub struct DumpTool {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl DumpTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        DumpTool {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the dump arguments, e.g. for wrapper scripts.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Uses `explicit` if configured, otherwise finds `mongodump` in PATH.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        let program = find_executable(explicit, DEFAULT_DUMP_TOOL)?;
        info!("Found dump tool at: {}", program.display());
        Ok(DumpTool::new(program))
    }

    /// Runs the dump to `destination`. A failed dump leaves whatever it wrote in place.
    pub async fn capture(&self, uri: &str, destination: &Path) -> Result<CaptureHandle> {
        info!(
            "Creating database dump of {} at {}",
            mask_credentials(uri),
            destination.display()
        );

        let mut archive_arg = OsString::from("--archive=");
        archive_arg.push(destination.as_os_str());

        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(format!("--uri={}", uri))
            .arg(archive_arg)
            .arg("--gzip")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackupError::capture(format!("failed to start {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr)
                .trim()
                .replace(uri, &mask_credentials(uri));
            error!(
                "{} failed with {}\nStderr: {}",
                self.program.display(),
                output.status,
                stderr
            );
            let last_line = stderr.lines().last().unwrap_or("no output").to_string();
            return Err(BackupError::Capture {
                message: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    last_line
                ),
                stderr,
            });
        }

        let size_bytes = tokio::fs::metadata(destination)
            .await
            .map_err(|e| {
                BackupError::capture(format!(
                    "{} reported success but left no dump at {}: {}",
                    self.program.display(),
                    destination.display(),
                    e
                ))
            })?
            .len();

        info!("✓ Dump created ({} bytes)", size_bytes);
        Ok(CaptureHandle {
            dump_path: destination.to_path_buf(),
        })
    }
}
