//! Encrypted database backups.
//!
//! Captures a `mongodump` archive, streams it through AES-256-GCM and stores
//! `IV(16) || ciphertext || tag(16)` artifacts; restores them only after the
//! tag authenticates.

pub mod backup;
pub mod config;
pub mod container;
pub mod crypto;
pub mod errors;
pub mod restore;
pub mod utils;

pub use errors::{BackupError, CleanupWarning};
