// vaultdump/src/config/mod.rs
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::EncryptionKey;
use crate::errors::{BackupError, Result};
use crate::utils::connection::ProbeSettings;

pub const DEFAULT_BACKUP_DIR: &str = "./backups";
pub const DEFAULT_DUMP_TOOL: &str = "mongodump";

pub const ENV_MONGO_URI: &str = "MONGO_URI";
pub const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";
pub const ENV_BACKUP_DIR: &str = "BACKUP_DIR";
pub const ENV_DUMP_TOOL: &str = "MONGODUMP_PATH";
pub const ENV_PROBE_CONNECTION: &str = "BACKUP_PROBE_CONNECTION";
pub const ENV_MAX_RETRIES: &str = "DB_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "DB_RETRY_DELAY_MS";

/// Environment values as found, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawEnvConfig {
    pub mongo_uri: Option<String>,
    pub encryption_key: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub dump_tool: Option<PathBuf>,
    pub probe_connection: Option<String>,
    pub max_retries: Option<String>,
    pub retry_delay_ms: Option<String>,
}

impl RawEnvConfig {
    /// Reads the process environment. Call `dotenv` beforehand to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        RawEnvConfig {
            mongo_uri: non_empty(ENV_MONGO_URI),
            encryption_key: non_empty(ENV_ENCRYPTION_KEY),
            backup_dir: non_empty(ENV_BACKUP_DIR).map(PathBuf::from),
            dump_tool: non_empty(ENV_DUMP_TOOL).map(PathBuf::from),
            probe_connection: non_empty(ENV_PROBE_CONNECTION),
            max_retries: non_empty(ENV_MAX_RETRIES),
            retry_delay_ms: non_empty(ENV_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub mongo_uri: String,
    pub key: EncryptionKey,
    pub backup_dir: PathBuf,
    pub dump_tool: Option<PathBuf>,
    pub probe: Option<ProbeSettings>,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub key: EncryptionKey,
    pub artifact_path: PathBuf,
    pub output_path: Option<PathBuf>,
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| BackupError::Configuration(format!("{} is missing from the environment / .env", name)))
}

fn load_key(raw: &RawEnvConfig) -> Result<EncryptionKey> {
    EncryptionKey::from_hex(&required(&raw.encryption_key, ENV_ENCRYPTION_KEY)?)
}

pub fn load_backup_config(raw: &RawEnvConfig) -> Result<BackupConfig> {
    let mongo_uri = required(&raw.mongo_uri, ENV_MONGO_URI)?;
    let key = load_key(raw)?;

    let probe = if parse_flag(raw.probe_connection.as_deref(), ENV_PROBE_CONNECTION)? {
        Some(load_probe_settings(raw)?)
    } else {
        None
    };

    Ok(BackupConfig {
        mongo_uri,
        key,
        backup_dir: raw
            .backup_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR)),
        dump_tool: raw.dump_tool.clone(),
        probe,
    })
}

/// Restore and verify only need the key; the database URI is not consulted.
pub fn load_restore_config(
    raw: &RawEnvConfig,
    artifact_path: PathBuf,
    output_path: Option<PathBuf>,
) -> Result<RestoreConfig> {
    if artifact_path.as_os_str().is_empty() {
        return Err(BackupError::Configuration(
            "artifact path cannot be empty".to_string(),
        ));
    }
    Ok(RestoreConfig {
        key: load_key(raw)?,
        artifact_path,
        output_path,
    })
}

fn load_probe_settings(raw: &RawEnvConfig) -> Result<ProbeSettings> {
    let mut settings = ProbeSettings::default();
    if let Some(value) = &raw.max_retries {
        settings.max_retries = value.trim().parse().map_err(|_| {
            BackupError::Configuration(format!("{} must be a non-negative integer, got '{}'", ENV_MAX_RETRIES, value))
        })?;
    }
    if let Some(value) = &raw.retry_delay_ms {
        let millis: u64 = value.trim().parse().map_err(|_| {
            BackupError::Configuration(format!("{} must be milliseconds, got '{}'", ENV_RETRY_DELAY_MS, value))
        })?;
        settings.retry_delay = Duration::from_millis(millis);
    }
    Ok(settings)
}

fn parse_flag(value: Option<&str>, name: &str) -> Result<bool> {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(BackupError::Configuration(format!(
            "{} must be true or false, got '{}'",
            name, v
        ))),
    }
}
