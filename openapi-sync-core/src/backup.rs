//! File safety helpers: atomic writes and restore-on-failure backups.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Write `contents` to `path` via a temporary file in the same directory.
///
/// Readers see either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    match fs::metadata(path) {
        Ok(existing) => tmp.as_file().set_permissions(existing.permissions())?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => set_new_file_mode(tmp.as_file())?,
        Err(e) => return Err(e),
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Temp files are created owner-only; new files get the usual `rw-r--r--`.
#[cfg(unix)]
fn set_new_file_mode(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_new_file_mode(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

/// A copy of a file taken before a risky modification.
///
/// Dropping the guard restores the original unless [`FileBackup::discard`]
/// was called, so an early return through `?` leaves the file untouched.
#[derive(Debug)]
pub struct FileBackup {
    original: PathBuf,
    backup: PathBuf,
    armed: bool,
}

impl FileBackup {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".backup");
        let backup = path.with_file_name(name);
        fs::copy(path, &backup)?;
        debug!(path = %path.display(), backup = %backup.display(), "Created backup");
        Ok(Self {
            original: path.to_path_buf(),
            backup,
            armed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.original
    }

    /// Content as it was when the backup was taken.
    pub fn original_contents(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.backup)
    }

    /// Whether the file differs from the backed-up content.
    pub fn is_modified(&self) -> io::Result<bool> {
        let current = match fs::read(&self.original) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };
        Ok(current != self.original_contents()?)
    }

    /// Put the original content back and drop the backup copy.
    pub fn restore(mut self) -> io::Result<()> {
        self.armed = false;
        self.put_back()
    }

    /// Keep the current content and drop the backup copy.
    pub fn discard(mut self) -> io::Result<()> {
        self.armed = false;
        fs::remove_file(&self.backup)
    }

    fn put_back(&self) -> io::Result<()> {
        let contents = fs::read(&self.backup)?;
        write_atomic(&self.original, &contents)?;
        fs::remove_file(&self.backup)?;
        debug!(path = %self.original.display(), "Restored from backup");
        Ok(())
    }
}

impl Drop for FileBackup {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.put_back() {
                warn!(error = ?e, path = %self.original.display(), "Failed to restore backup");
            }
        }
    }
}
