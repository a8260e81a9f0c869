// vaultdump/src/utils/connection.rs
//! Pre-flight reachability check for the source database.
//!
//! Bounded, iterative retries over an explicit attempt context. The probe
//! never exits the process; the caller decides what a failed probe means.
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::errors::{BackupError, Result};
use crate::utils::mask_credentials;

pub const DEFAULT_MONGO_PORT: u16 = 27017;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            max_retries: 5,
            retry_delay: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Retrying,
    Connected,
    Failed,
}

/// Where one probe run got to.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub state: ConnectionState,
    pub attempts: u32,
    pub connected_to: Option<String>,
    pub last_error: Option<String>,
}

impl ConnectionAttempt {
    fn new() -> Self {
        ConnectionAttempt {
            state: ConnectionState::Idle,
            attempts: 0,
            connected_to: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionProbe {
    hosts: Vec<(String, u16)>,
    settings: ProbeSettings,
}

impl ConnectionProbe {
    /// `Ok(None)` for `mongodb+srv://` URIs: SRV lookup is left to the dump tool.
    pub fn from_uri(uri: &str, settings: ProbeSettings) -> Result<Option<Self>> {
        if uri.starts_with("mongodb+srv://") {
            return Ok(None);
        }
        let hosts = parse_hosts(uri)?;
        Ok(Some(ConnectionProbe { hosts, settings }))
    }

    pub async fn connect(&self) -> ConnectionAttempt {
        let mut attempt = ConnectionAttempt::new();
        attempt.state = ConnectionState::Connecting;

        loop {
            attempt.attempts += 1;
            match self.try_hosts().await {
                Ok(host) => {
                    info!("Database reachable at {} (attempt {})", host, attempt.attempts);
                    attempt.state = ConnectionState::Connected;
                    attempt.connected_to = Some(host);
                    return attempt;
                }
                Err(reason) => {
                    attempt.last_error = Some(reason.clone());
                    if attempt.attempts > self.settings.max_retries {
                        warn!("Max retries reached; database unreachable: {}", reason);
                        attempt.state = ConnectionState::Failed;
                        return attempt;
                    }
                    warn!(
                        "Database not reachable ({}); retrying in {:?} (attempt {}/{})",
                        reason,
                        self.settings.retry_delay,
                        attempt.attempts,
                        self.settings.max_retries
                    );
                    attempt.state = ConnectionState::Retrying;
                    sleep(self.settings.retry_delay).await;
                    attempt.state = ConnectionState::Connecting;
                }
            }
        }
    }

    async fn try_hosts(&self) -> std::result::Result<String, String> {
        let mut errors = Vec::new();
        for (host, port) in &self.hosts {
            let target = format!("{}:{}", host, port);
            match timeout(self.settings.connect_timeout, TcpStream::connect((host.as_str(), *port))).await {
                Ok(Ok(_stream)) => return Ok(target),
                Ok(Err(e)) => errors.push(format!("{}: {}", target, e)),
                Err(_) => errors.push(format!("{}: timed out", target)),
            }
        }
        Err(errors.join("; "))
    }
}

/// Runs the probe when configured and turns a failed probe into a `CaptureError`.
pub async fn ensure_reachable(uri: &str, settings: &ProbeSettings) -> Result<()> {
    let Some(probe) = ConnectionProbe::from_uri(uri, settings.clone())? else {
        info!("Skipping connection probe for SRV URI {}", mask_credentials(uri));
        return Ok(());
    };
    let attempt = probe.connect().await;
    match attempt.state {
        ConnectionState::Connected => Ok(()),
        _ => Err(BackupError::capture(format!(
            "database at {} unreachable after {} attempt(s): {}",
            mask_credentials(uri),
            attempt.attempts,
            attempt.last_error.unwrap_or_default()
        ))),
    }
}

/// Host list of a `mongodb://` URI: userinfo dropped, comma-separated seeds, default port 27017.
pub fn parse_hosts(uri: &str) -> Result<Vec<(String, u16)>> {
    let rest = uri.strip_prefix("mongodb://").ok_or_else(|| {
        BackupError::Configuration(format!(
            "unsupported connection string scheme: {}",
            mask_credentials(uri)
        ))
    })?;
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let hosts_part = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);

    let mut hosts = Vec::new();
    for seed in hosts_part.split(',').filter(|s| !s.is_empty()) {
        hosts.push(parse_seed(seed, uri)?);
    }
    if hosts.is_empty() {
        return Err(BackupError::Configuration(format!(
            "no hosts in connection string {}",
            mask_credentials(uri)
        )));
    }
    Ok(hosts)
}

fn parse_seed(seed: &str, uri: &str) -> Result<(String, u16)> {
    let bad_port = || {
        BackupError::Configuration(format!(
            "invalid port in connection string {}",
            mask_credentials(uri)
        ))
    };
    // [::1]:27017
    if let Some(v6) = seed.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(bad_port)?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad_port())?,
            None => DEFAULT_MONGO_PORT,
        };
        return Ok((host.to_string(), port));
    }
    match seed.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| bad_port())?)),
        None => Ok((seed.to_string(), DEFAULT_MONGO_PORT)),
    }
}
