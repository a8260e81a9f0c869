use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RestoreConfig;
use crate::container::{restore_file, verify_file};
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub artifact_path: PathBuf,
    pub output_path: PathBuf,
    pub plaintext_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub artifact_path: PathBuf,
    pub plaintext_bytes: u64,
}

/// `backups/backup-<ts>.enc` restores to `backups/restored-<ts>.gz`.
pub fn default_output_path(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".to_string());
    let base = match stem.strip_prefix("backup-") {
        Some(timestamp) => format!("restored-{}", timestamp),
        None => format!("{}-restored", stem),
    };
    artifact.with_file_name(format!("{}.gz", base))
}

pub(crate) async fn perform_restore(config: &RestoreConfig) -> Result<RestoreReport> {
    let artifact_path = config.artifact_path.clone();
    let output_path = config
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(&artifact_path));
    info!(
        "🔄 Restoring {} to {}",
        artifact_path.display(),
        output_path.display()
    );

    let key = config.key.clone();
    let (artifact, output) = (artifact_path.clone(), output_path.clone());
    let plaintext_bytes = tokio::task::spawn_blocking(move || restore_file(&artifact, &output, &key))
        .await
        .map_err(|e| BackupError::restore("restore task did not complete", std::io::Error::other(e)))??;

    Ok(RestoreReport {
        artifact_path,
        output_path,
        plaintext_bytes,
    })
}

pub(crate) async fn perform_verify(config: &RestoreConfig) -> Result<VerifyReport> {
    let key = config.key.clone();
    let artifact = config.artifact_path.clone();
    let plaintext_bytes = tokio::task::spawn_blocking(move || verify_file(&artifact, &key))
        .await
        .map_err(|e| BackupError::restore("verify task did not complete", std::io::Error::other(e)))??;
    Ok(VerifyReport {
        artifact_path: config.artifact_path.clone(),
        plaintext_bytes,
    })
}
