pub(crate) mod logic;

use crate::config::RestoreConfig;
use crate::errors::Result;

pub use logic::{RestoreReport, VerifyReport, default_output_path};

/// Public entry point for the restore process.
pub async fn run_restore_flow(config: &RestoreConfig) -> Result<RestoreReport> {
    logic::perform_restore(config).await
}

/// Authenticates an artifact without writing any plaintext.
pub async fn run_verify_flow(config: &RestoreConfig) -> Result<VerifyReport> {
    logic::perform_verify(config).await
}
