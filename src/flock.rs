//! Advisory lock on the data directory. One engine process owns a file
//! set at a time; sharing the same directory between processes is
//! explicitly unsupported.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Exclusive advisory lock over an engine directory, taken through a lock
/// file inside it. Held for the lifetime of the guard; dropping the guard
/// releases the lock.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Takes the exclusive lock at `path`, failing when another live
    /// process already holds it.
    pub fn lock(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| crate::error::Error::IO(format!("open {}: {e}", path.display())))?;

        Self::acquire(&file)
            .map_err(|e| crate::error::Error::IO(format!("lock {}: {e}", path.display())))?;

        // Now that the lock is ours, leave the owning pid behind for
        // whoever has to debug a stuck directory.
        file.set_len(0)
            .map_err(|e| crate::error::Error::IO(format!("truncate {}: {e}", path.display())))?;
        let mut note = &file;
        writeln!(note, "{}", std::process::id())
            .and_then(|()| note.flush())
            .map_err(|e| crate::error::Error::IO(format!("write {}: {e}", path.display())))?;

        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn acquire(file: &File) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error()),
        }
    }

    #[cfg(not(unix))]
    fn acquire(_file: &File) -> std::io::Result<()> {
        // No advisory locking on this platform; the engine still runs,
        // unguarded.
        Ok(())
    }

    /// Releases the lock. Equivalent to dropping the guard; the lock file
    /// itself stays behind to avoid unlink races with a waiting process.
    pub fn unlock(self) -> Result<()> {
        drop(self.file);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
