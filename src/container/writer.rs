use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder as TempFileBuilder, NamedTempFile};
use tracing::{debug, info};

use super::CHUNK_LEN;
use crate::crypto::{CipherSession, EncryptionKey, Iv};
use crate::errors::{BackupError, Result};

/// Streams plaintext into `IV || ciphertext || tag` on any writer.
///
/// The IV goes out as soon as the session exists; the tag only in [`ArtifactWriter::finish`].
/// Dropping the writer early leaves output without a tag, which never authenticates.
pub struct ArtifactWriter<W: Write> {
    inner: W,
    session: CipherSession,
}

impl<W: Write> ArtifactWriter<W> {
    pub fn new(mut inner: W, key: &EncryptionKey) -> Result<Self> {
        let session = CipherSession::new(key)?;
        inner
            .write_all(session.iv())
            .map_err(|e| BackupError::encryption("failed to write artifact IV", e))?;
        Ok(ArtifactWriter { inner, session })
    }

    pub fn iv(&self) -> &Iv {
        self.session.iv()
    }

    pub fn plaintext_len(&self) -> u64 {
        self.session.processed_len()
    }

    /// Encrypts `chunk` in place and writes it out.
    pub fn write_chunk(&mut self, chunk: &mut [u8]) -> Result<()> {
        self.session.update_in_place(chunk)?;
        self.inner
            .write_all(chunk)
            .map_err(|e| BackupError::encryption("failed to write ciphertext", e))
    }

    /// Pumps `source` to EOF through the cipher. Returns the plaintext byte count.
    pub fn copy_from<R: Read>(&mut self, mut source: R) -> Result<u64> {
        let mut buf = vec![0u8; CHUNK_LEN];
        let mut total = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(BackupError::encryption("failed to read plaintext", e)),
            };
            self.write_chunk(&mut buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Appends the tag and flushes. Only now is the output a complete artifact.
    pub fn finish(self) -> Result<W> {
        let ArtifactWriter { mut inner, session } = self;
        let tag = session.finalize();
        inner
            .write_all(&tag)
            .map_err(|e| BackupError::encryption("failed to write authentication tag", e))?;
        inner
            .flush()
            .map_err(|e| BackupError::encryption("failed to flush artifact", e))?;
        Ok(inner)
    }
}

/// Seals everything `source` yields into `destination`.
pub fn seal<R: Read, W: Write>(source: R, destination: W, key: &EncryptionKey) -> Result<W> {
    let mut writer = ArtifactWriter::new(destination, key)?;
    writer.copy_from(source)?;
    writer.finish()
}

/// A finished artifact sitting at its final path.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub iv: Iv,
    pub plaintext_len: u64,
    pub size_bytes: u64,
}

/// An artifact being written to a hidden temporary file next to its destination.
///
/// Nothing appears under the destination name until [`PendingArtifact::commit`]
/// has written the tag, synced and renamed. Dropping it removes the temporary file.
pub struct PendingArtifact {
    writer: ArtifactWriter<BufWriter<NamedTempFile>>,
    destination: PathBuf,
}

impl PendingArtifact {
    pub fn create(destination: &Path, key: &EncryptionKey) -> Result<Self> {
        let dir = parent_dir(destination);
        let temp = TempFileBuilder::new()
            .prefix(".partial-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                BackupError::encryption(
                    format!("failed to create temporary artifact in {}", dir.display()),
                    e,
                )
            })?;
        debug!("Writing artifact to temporary file {}", temp.path().display());
        let writer = ArtifactWriter::new(BufWriter::with_capacity(CHUNK_LEN, temp), key)?;
        Ok(PendingArtifact {
            writer,
            destination: destination.to_path_buf(),
        })
    }

    pub fn copy_from<R: Read>(&mut self, source: R) -> Result<u64> {
        self.writer.copy_from(source)
    }

    /// Writes the tag, syncs and renames into place. Refuses to replace an existing file.
    pub fn commit(self) -> Result<ArtifactInfo> {
        let PendingArtifact {
            writer,
            destination,
        } = self;
        let iv = *writer.iv();
        let plaintext_len = writer.plaintext_len();

        let temp = writer
            .finish()?
            .into_inner()
            .map_err(|e| BackupError::encryption("failed to flush artifact", e.into_error()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| BackupError::encryption("failed to sync artifact to disk", e))?;

        let file = temp.persist_noclobber(&destination).map_err(|e| {
            BackupError::encryption(
                format!("failed to move artifact into place at {}", destination.display()),
                e.error,
            )
        })?;
        sync_dir(parent_dir(&destination))
            .map_err(|e| BackupError::encryption("failed to sync backup directory", e))?;
        let size_bytes = file
            .metadata()
            .map_err(|e| BackupError::encryption("failed to stat finished artifact", e))?
            .len();

        info!(
            "Artifact sealed: {} ({} bytes, plaintext {} bytes)",
            destination.display(),
            size_bytes,
            plaintext_len
        );
        Ok(ArtifactInfo {
            path: destination,
            iv,
            plaintext_len,
            size_bytes,
        })
    }
}

/// Encrypts the file at `source` into a new artifact at `destination`.
pub fn seal_file(source: &Path, destination: &Path, key: &EncryptionKey) -> Result<ArtifactInfo> {
    let input = File::open(source).map_err(|e| {
        BackupError::encryption(format!("failed to open {}", source.display()), e)
    })?;
    let mut pending = PendingArtifact::create(destination, key)?;
    pending.copy_from(BufReader::with_capacity(CHUNK_LEN, input))?;
    pending.commit()
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
