use chrono::Utc;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::backup::db_dump::{CaptureHandle, DumpTool};
use crate::config::BackupConfig;
use crate::container::{CHUNK_LEN, PendingArtifact};
use crate::crypto::EncryptionKey;
use crate::errors::{BackupError, CleanupWarning, Result};
use crate::utils::connection::{ProbeSettings, ensure_reachable};
use crate::utils::{artifact_file_name, backup_timestamp, temp_dump_file_name};

/// Lifecycle of one backup run. Strictly forward; `Failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Capturing,
    Encrypting,
    Finalizing,
    CleaningUp,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Capturing)
                | (Capturing, Encrypting)
                | (Encrypting, Finalizing)
                | (Finalizing, CleaningUp)
                | (CleaningUp, Succeeded)
        ) || (next == Failed && !self.is_terminal())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub artifact_path: PathBuf,
    pub iv_hex: String,
    pub dump_bytes: u64,
    pub artifact_bytes: u64,
    pub cleanup_warning: Option<CleanupWarning>,
}

/// Drives capture → encrypt → finalize → cleanup once.
pub struct BackupPipeline {
    mongo_uri: String,
    key: EncryptionKey,
    backup_dir: PathBuf,
    tool: DumpTool,
    probe: Option<ProbeSettings>,
    timestamp: String,
    state: RunState,
    history: Vec<RunState>,
}

impl BackupPipeline {
    pub fn new(config: &BackupConfig, tool: DumpTool) -> Self {
        Self::with_timestamp(config, tool, backup_timestamp(Utc::now()))
    }

    pub fn with_timestamp(config: &BackupConfig, tool: DumpTool, timestamp: String) -> Self {
        BackupPipeline {
            mongo_uri: config.mongo_uri.clone(),
            key: config.key.clone(),
            backup_dir: config.backup_dir.clone(),
            tool,
            probe: config.probe.clone(),
            timestamp,
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn dump_path(&self) -> PathBuf {
        self.backup_dir.join(temp_dump_file_name(&self.timestamp))
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.backup_dir.join(artifact_file_name(&self.timestamp))
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Backup run {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn fail(&mut self, err: BackupError) -> BackupError {
        error!("❌ Backup failed while {:?} [{}]: {}", self.state, err.kind(), err);
        self.advance(RunState::Failed);
        err
    }

    /// Executes the run. A pipeline runs at most once.
    pub async fn execute(&mut self) -> Result<RunReport> {
        if self.state != RunState::Idle {
            return Err(BackupError::Configuration(format!(
                "backup run already executed (state {:?})",
                self.state
            )));
        }

        self.advance(RunState::Capturing);
        let capture = match self.capture().await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(e)),
        };

        self.advance(RunState::Encrypting);
        let dump_path = capture.dump_path.clone();
        let artifact_path = self.artifact_path();
        let key = self.key.clone();
        let pending = match tokio::task::spawn_blocking(move || encrypt_dump(&dump_path, &artifact_path, &key)).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(join) => return Err(self.fail(join_error(join))),
        };

        self.advance(RunState::Finalizing);
        let info = match tokio::task::spawn_blocking(move || pending.commit()).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(join) => return Err(self.fail(join_error(join))),
        };

        self.advance(RunState::CleaningUp);
        let cleanup_warning = cleanup_dump(&capture.dump_path).await;

        self.advance(RunState::Succeeded);
        info!("🎉 Backup successfully encrypted to: {}", info.path.display());
        Ok(RunReport {
            artifact_path: info.path,
            iv_hex: hex::encode(info.iv),
            dump_bytes: info.plaintext_len,
            artifact_bytes: info.size_bytes,
            cleanup_warning,
        })
    }

    async fn capture(&self) -> Result<CaptureHandle> {
        tokio::fs::create_dir_all(&self.backup_dir).await.map_err(|e| {
            BackupError::capture(format!(
                "failed to create backup directory {}: {}",
                self.backup_dir.display(),
                e
            ))
        })?;

        if let Some(settings) = &self.probe {
            ensure_reachable(&self.mongo_uri, settings).await?;
        }

        self.tool.capture(&self.mongo_uri, &self.dump_path()).await
    }
}

/// Streams the dump into a pending artifact. Nothing is visible under the final name yet.
fn encrypt_dump(dump_path: &Path, artifact_path: &Path, key: &EncryptionKey) -> Result<PendingArtifact> {
    info!("Dump created. Encrypting...");
    let input = File::open(dump_path).map_err(|e| {
        BackupError::encryption(format!("failed to open dump {}", dump_path.display()), e)
    })?;
    let mut pending = PendingArtifact::create(artifact_path, key)?;
    let copied = pending.copy_from(BufReader::with_capacity(CHUNK_LEN, input))?;
    debug!("Encrypted {} bytes of dump", copied);
    Ok(pending)
}

/// Removes the plaintext dump. Failure is reported, never fatal.
async fn cleanup_dump(dump_path: &Path) -> Option<CleanupWarning> {
    match tokio::fs::remove_file(dump_path).await {
        Ok(()) => {
            info!("Cleaned up temporary dump {}", dump_path.display());
            None
        }
        Err(e) => {
            let warning = CleanupWarning {
                path: dump_path.to_path_buf(),
                reason: e.to_string(),
            };
            warn!("⚠️ Warning: {}", warning);
            Some(warning)
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> BackupError {
    BackupError::encryption("encryption task did not complete", std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_state_machine_is_forward_only() {
        use RunState::*;
        let order = [Idle, Capturing, Encrypting, Finalizing, CleaningUp, Succeeded];
        for (i, from) in order.iter().enumerate() {
            for (j, to) in order.iter().enumerate() {
                assert_eq!(from.can_advance_to(*to), j == i + 1, "{from:?} -> {to:?}");
            }
        }
        for state in [Idle, Capturing, Encrypting, Finalizing, CleaningUp] {
            assert!(state.can_advance_to(Failed));
        }
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Idle));
    }

    #[tokio::test]
    async fn test_cleanup_dump_removes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("temp-dump-T.gz");
        fs::write(&dump, b"plaintext")?;

        assert!(cleanup_dump(&dump).await.is_none());
        assert!(!dump.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_dump_failure_becomes_warning() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("temp-dump-T.gz");
        fs::create_dir(&dump)?;
        fs::write(dump.join("keep"), b"x")?;

        let warning = cleanup_dump(&dump).await.expect("directory cannot be removed as a file");

        assert_eq!(warning.path, dump);
        assert!(!warning.reason.is_empty());
        assert!(dump.exists());
        Ok(())
    }

    #[cfg(unix)]
    mod runs {
        use super::*;
        use crate::backup::db_dump::fake_tool;
        use crate::container::open;
        use tempfile::tempdir;

        fn config(dir: &Path) -> BackupConfig {
            BackupConfig {
                mongo_uri: "mongodb://localhost:27017/votes".to_string(),
                key: EncryptionKey::from_bytes([0x42u8; 32]),
                backup_dir: dir.to_path_buf(),
                dump_tool: None,
                probe: None,
            }
        }

        fn names(dir: &Path) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(dir)
                .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect())
                .unwrap_or_default();
            names.sort();
            names
        }

        #[tokio::test]
        async fn test_successful_run_leaves_one_artifact_and_no_dump() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let config = config(dir.path());
            let mut pipeline = BackupPipeline::with_timestamp(
                &config,
                fake_tool::writing("compressed-archive"),
                "2026-10-19T08-15-02-123Z".to_string(),
            );

            let report = pipeline.execute().await?;

            assert_eq!(pipeline.state(), RunState::Succeeded);
            assert_eq!(
                pipeline.history(),
                &[
                    RunState::Idle,
                    RunState::Capturing,
                    RunState::Encrypting,
                    RunState::Finalizing,
                    RunState::CleaningUp,
                    RunState::Succeeded
                ]
            );
            assert_eq!(names(dir.path()), vec!["backup-2026-10-19T08-15-02-123Z.enc".to_string()]);
            assert_eq!(report.dump_bytes, 18);
            assert_eq!(report.artifact_bytes, 18 + 32);
            assert!(report.cleanup_warning.is_none());

            let artifact = fs::read(&report.artifact_path)?;
            assert_eq!(open(&artifact, &config.key)?, b"compressed-archive");
            assert_eq!(hex::encode(&artifact[..16]), report.iv_hex);
            Ok(())
        }

        #[tokio::test]
        async fn test_undeletable_dump_still_succeeds_with_warning() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let config = config(dir.path());
            let mut pipeline = BackupPipeline::with_timestamp(
                &config,
                fake_tool::writing_undeletable("compressed-archive"),
                "T".to_string(),
            );

            let report = pipeline.execute().await?;

            assert_eq!(pipeline.state(), RunState::Succeeded);
            assert!(pipeline.history().contains(&RunState::CleaningUp));
            let warning = report.cleanup_warning.expect("cleanup warning recorded");
            assert_eq!(warning.path, pipeline.dump_path());
            assert_eq!(names(dir.path()), vec!["backup-T.enc".to_string(), "temp-dump-T.gz".to_string()]);

            let artifact = fs::read(&report.artifact_path)?;
            assert_eq!(open(&artifact, &config.key)?, b"compressed-archive");
            Ok(())
        }

        #[tokio::test]
        async fn test_capture_failure_ends_failed_without_artifact() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let mut pipeline = BackupPipeline::new(&config(dir.path()), fake_tool::failing(1, "auth failed"));

            let err = pipeline.execute().await.unwrap_err();

            assert_eq!(err.kind(), "CaptureError");
            assert_eq!(pipeline.state(), RunState::Failed);
            assert!(!pipeline.history().contains(&RunState::Encrypting));
            assert!(names(dir.path()).iter().all(|n| !n.ends_with(".enc")));
            Ok(())
        }

        #[tokio::test]
        async fn test_partial_dump_survives_capture_failure() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let mut pipeline = BackupPipeline::new(&config(dir.path()), fake_tool::failing_after_partial_write());

            assert!(pipeline.execute().await.is_err());
            assert!(pipeline.dump_path().exists());
            assert!(!pipeline.artifact_path().exists());
            Ok(())
        }

        #[tokio::test]
        async fn test_existing_artifact_fails_run_and_keeps_dump() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let config = config(dir.path());
            let ts = "2026-01-01T00-00-00-000Z".to_string();
            let mut pipeline = BackupPipeline::with_timestamp(&config, fake_tool::writing("x"), ts);
            fs::write(pipeline.artifact_path(), b"earlier artifact")?;

            let err = pipeline.execute().await.unwrap_err();

            assert_eq!(err.kind(), "EncryptionError");
            assert_eq!(pipeline.state(), RunState::Failed);
            assert!(pipeline.history().contains(&RunState::Finalizing));
            assert_eq!(fs::read(pipeline.artifact_path())?, b"earlier artifact");
            assert!(pipeline.dump_path().exists());
            Ok(())
        }

        #[tokio::test]
        async fn test_pipeline_runs_once() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let mut pipeline = BackupPipeline::new(&config(dir.path()), fake_tool::writing("x"));
            pipeline.execute().await?;
            let err = pipeline.execute().await.unwrap_err();
            assert_eq!(err.kind(), "ConfigurationError");
            assert_eq!(pipeline.state(), RunState::Succeeded);
            Ok(())
        }

        #[tokio::test]
        async fn test_unreachable_database_fails_before_dump() -> anyhow::Result<()> {
            let dir = tempdir()?;
            let port = {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
                listener.local_addr()?.port()
            };
            let mut config = config(dir.path());
            config.mongo_uri = format!("mongodb://127.0.0.1:{}/votes", port);
            config.probe = Some(ProbeSettings {
                max_retries: 0,
                retry_delay: std::time::Duration::from_millis(1),
                connect_timeout: std::time::Duration::from_secs(1),
            });
            let mut pipeline = BackupPipeline::new(&config, fake_tool::writing("x"));

            let err = pipeline.execute().await.unwrap_err();

            assert_eq!(err.kind(), "CaptureError");
            assert_eq!(pipeline.state(), RunState::Failed);
            assert!(names(dir.path()).is_empty());
            Ok(())
        }
    }
}
