use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::Builder as TempFileBuilder;
use tracing::{debug, info, warn};

use super::writer::{parent_dir, sync_dir};
use super::{CHUNK_LEN, OVERHEAD};
use crate::crypto::{DecipherSession, EncryptionKey, IV_LEN, TAG_LEN};
use crate::errors::{BackupError, Result};

/// Ciphertext length implied by the artifact size.
fn ciphertext_len(total_len: u64) -> Result<u64> {
    if total_len < OVERHEAD {
        return Err(BackupError::Integrity(format!(
            "artifact is {} bytes, shorter than the {} bytes of IV and tag framing",
            total_len, OVERHEAD
        )));
    }
    Ok(total_len - OVERHEAD)
}

fn read_error(context: &'static str) -> impl Fn(io::Error) -> BackupError {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            BackupError::Integrity(format!("{context}: artifact ended early"))
        } else {
            BackupError::restore(context, e)
        }
    }
}

/// Decrypts into `out` and checks the tag last. Whatever lands in `out` is
/// unauthenticated until this returns `Ok`, so callers must stage it.
fn decrypt_into<R, W>(artifact: &mut R, total_len: u64, key: &EncryptionKey, out: &mut W) -> Result<u64>
where
    R: Read + Seek,
    W: Write,
{
    let ciphertext_len = ciphertext_len(total_len)?;

    let mut iv = [0u8; IV_LEN];
    artifact
        .seek(SeekFrom::Start(0))
        .map_err(read_error("failed to seek to IV"))?;
    artifact.read_exact(&mut iv).map_err(read_error("failed to read IV"))?;

    let mut tag = [0u8; TAG_LEN];
    artifact
        .seek(SeekFrom::Start(total_len - TAG_LEN as u64))
        .map_err(read_error("failed to seek to tag"))?;
    artifact.read_exact(&mut tag).map_err(read_error("failed to read tag"))?;

    artifact
        .seek(SeekFrom::Start(IV_LEN as u64))
        .map_err(read_error("failed to seek to ciphertext"))?;

    debug!(
        "Artifact framing: iv={}, ciphertext {} bytes",
        hex::encode(iv),
        ciphertext_len
    );

    let mut session = DecipherSession::new(key, &iv);
    let mut buf = vec![0u8; CHUNK_LEN];
    let mut remaining = ciphertext_len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_LEN as u64) as usize;
        artifact
            .read_exact(&mut buf[..want])
            .map_err(read_error("failed to read ciphertext"))?;
        session.update_in_place(&mut buf[..want])?;
        out.write_all(&buf[..want])
            .map_err(|e| BackupError::restore("failed to write plaintext", e))?;
        remaining -= want as u64;
    }

    session.verify(&tag)?;
    Ok(ciphertext_len)
}

/// Decrypts an in-memory artifact. Plaintext is returned only after the tag checks out.
pub fn open(artifact: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let total_len = artifact.len() as u64;
    let mut plaintext = Vec::with_capacity(ciphertext_len(total_len)? as usize);
    decrypt_into(&mut Cursor::new(artifact), total_len, key, &mut plaintext)?;
    Ok(plaintext)
}

fn open_artifact(path: &Path) -> Result<(BufReader<File>, u64)> {
    let file = File::open(path)
        .map_err(|e| BackupError::restore(format!("failed to open artifact {}", path.display()), e))?;
    let total_len = file
        .metadata()
        .map_err(|e| BackupError::restore(format!("failed to stat artifact {}", path.display()), e))?
        .len();
    Ok((BufReader::with_capacity(CHUNK_LEN, file), total_len))
}

/// Authenticates an artifact without keeping any plaintext. Returns the plaintext length.
pub fn verify_file(artifact_path: &Path, key: &EncryptionKey) -> Result<u64> {
    let (mut reader, total_len) = open_artifact(artifact_path)?;
    let plaintext_len = decrypt_into(&mut reader, total_len, key, &mut io::sink())?;
    info!(
        "Artifact {} authenticated ({} bytes of plaintext)",
        artifact_path.display(),
        plaintext_len
    );
    Ok(plaintext_len)
}

/// Decrypts `artifact_path` into a new file at `destination`.
///
/// Plaintext is staged in a hidden temporary file beside `destination` and only
/// renamed into place after the tag verifies. On any failure the staging file is removed.
pub fn restore_file(artifact_path: &Path, destination: &Path, key: &EncryptionKey) -> Result<u64> {
    if fs::symlink_metadata(destination).is_ok() {
        return Err(BackupError::Configuration(format!(
            "refusing to overwrite existing file {}",
            destination.display()
        )));
    }

    let (mut reader, total_len) = open_artifact(artifact_path)?;
    let dir = parent_dir(destination);
    let staging = TempFileBuilder::new()
        .prefix(".restore-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| {
            BackupError::restore(format!("failed to create staging file in {}", dir.display()), e)
        })?;

    let mut out = BufWriter::with_capacity(CHUNK_LEN, staging);
    let plaintext_len = match decrypt_into(&mut reader, total_len, key, &mut out) {
        Ok(len) => len,
        Err(e) => {
            warn!(
                "Discarding staged plaintext for {}: {}",
                artifact_path.display(),
                e
            );
            return Err(e);
        }
    };

    let staging = out
        .into_inner()
        .map_err(|e| BackupError::restore("failed to flush plaintext", e.into_error()))?;
    staging
        .as_file()
        .sync_all()
        .map_err(|e| BackupError::restore("failed to sync plaintext", e))?;
    staging.persist_noclobber(destination).map_err(|e| {
        BackupError::restore(
            format!("failed to move plaintext into place at {}", destination.display()),
            e.error,
        )
    })?;
    sync_dir(parent_dir(destination))
        .map_err(|e| BackupError::restore("failed to sync output directory", e))?;

    info!(
        "Restored {} -> {} ({} bytes)",
        artifact_path.display(),
        destination.display(),
        plaintext_len
    );
    Ok(plaintext_len)
}
