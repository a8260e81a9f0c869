//! On-disk artifact: `IV(16) || ciphertext(N) || tag(16)`.
//!
//! No magic number, version byte or length prefix. The ciphertext length is
//! implied by the file size.
pub mod reader;
pub mod writer;

use crate::crypto::{IV_LEN, TAG_LEN};

/// Fixed framing bytes around the ciphertext.
pub const OVERHEAD: u64 = (IV_LEN + TAG_LEN) as u64;

/// Read/write buffer size for streaming through the cipher.
pub const CHUNK_LEN: usize = 64 * 1024;

pub use reader::{open, restore_file, verify_file};
pub use writer::{ArtifactInfo, ArtifactWriter, PendingArtifact, seal, seal_file};
