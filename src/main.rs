//! Encrypted Database Backup Tool
//!
//! Provides CLI interface for encrypted backup, restore and verify operations

// vaultdump/src/main.rs
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vaultdump::BackupError;
use vaultdump::config::{RawEnvConfig, load_backup_config, load_restore_config};
use vaultdump::{backup, restore};

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let kind = e.downcast_ref::<BackupError>();
            eprintln!(
                "❌ Error [{}]: {:?}",
                kind.map_or("Error", BackupError::kind),
                e
            );
            ExitCode::from(exit_code(kind))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vaultdump=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit status per failure kind.
fn exit_code(kind: Option<&BackupError>) -> u8 {
    match kind {
        Some(BackupError::Configuration(_)) => 2,
        Some(BackupError::Capture { .. }) => 3,
        Some(BackupError::Encryption { .. }) => 4,
        Some(BackupError::Integrity(_)) => 5,
        Some(BackupError::Restore { .. }) => 6,
        None => 1,
    }
}

async fn run_app() -> Result<()> {
    // A missing .env is fine; the process environment may already be populated.
    dotenv::dotenv().ok();
    let raw = RawEnvConfig::from_env();

    let args: Vec<String> = env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let mut positional = args.iter().filter(|a| !a.starts_with("--")).map(|a| a.trim().to_string());

    let choice = match positional.next() {
        Some(choice) => choice,
        None => prompt_choice()?,
    };

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let config = load_backup_config(&raw).context("Failed to load backup configuration")?;
            let report = backup::run_backup_flow(&config)
                .await
                .context("Backup process failed")?;
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "Backup successfully encrypted to: {} ({} bytes)",
                    report.artifact_path.display(),
                    report.artifact_bytes
                );
                if let Some(warning) = &report.cleanup_warning {
                    println!("⚠️ Warning: {}", warning);
                }
            }
        }
        "2" | "restore" => {
            println!("🔄 Starting Restore Process...");
            let artifact = match positional.next() {
                Some(path) => PathBuf::from(path),
                None => PathBuf::from(prompt("Path to the .enc artifact: ")?),
            };
            let output = positional.next().map(PathBuf::from);
            let config = load_restore_config(&raw, artifact, output)
                .context("Failed to load restore configuration")?;
            let report = restore::run_restore_flow(&config)
                .await
                .context("Restore process failed")?;
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "Restored {} bytes to {}",
                    report.plaintext_bytes,
                    report.output_path.display()
                );
            }
        }
        "3" | "verify" => {
            println!("🔍 Verifying Artifact...");
            let artifact = match positional.next() {
                Some(path) => PathBuf::from(path),
                None => PathBuf::from(prompt("Path to the .enc artifact: ")?),
            };
            let config = load_restore_config(&raw, artifact, None)
                .context("Failed to load verify configuration")?;
            let report = restore::run_verify_flow(&config)
                .await
                .context("Verification failed")?;
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "✓ {} is authentic ({} bytes of plaintext)",
                    report.artifact_path.display(),
                    report.plaintext_bytes
                );
            }
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup), '2' (restore), or '3' (verify).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Prompts user to select an operation
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Take Encrypted Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. Verify Backup Artifact (or type 'verify')");
    prompt("Enter your choice: ")
}

fn prompt(message: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}", message);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
