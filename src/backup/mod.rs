pub(crate) mod db_dump;
pub(crate) mod logic;

use tracing::info;

use crate::config::BackupConfig;
use crate::errors::Result;

pub use db_dump::{CaptureHandle, DumpTool};
pub use logic::{BackupPipeline, RunReport, RunState};

/// Public entry point for the backup process.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<RunReport> {
    let tool = DumpTool::locate(config.dump_tool.as_deref())?;
    info!("Backup directory: {}", config.backup_dir.display());
    BackupPipeline::new(config, tool).execute().await
}
