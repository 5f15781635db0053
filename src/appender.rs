//! Append-only file writer with a byte-threshold flush policy.
//!
//! Bytes submitted through [`Appender::append`] accumulate in a staging
//! buffer and are written through once the buffer reaches the configured
//! size, on [`flush`](Appender::flush), or when the appender is dropped.
//! Callers submit whole records, so a record is never split across the
//! staging boundary. Instead of relying on platform append-mode semantics
//! the appender seeks to the end once and tracks the logical size itself.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

pub struct Appender {
    file: File,
    path: PathBuf,
    staged: Vec<u8>,
    buffer_size: usize,
    /// Logical size: bytes on disk plus staged bytes.
    size: u64,
}

impl Appender {
    /// Opens `path` for read/write (creating it if missing) and positions
    /// the write cursor at the end.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| crate::error::Error::IO(format!("open {}: {e}", path.display())))?;
        let size = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            staged: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            size,
        })
    }

    /// Stages `bytes` for appending, writing through once the staging
    /// buffer reaches the threshold.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.staged.extend_from_slice(bytes);
        self.size += bytes.len() as u64;
        if self.staged.len() >= self.buffer_size {
            self.write_staged()?;
        }
        Ok(())
    }

    /// Writes any staged bytes through to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.write_staged()?;
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Drops staged bytes and truncates the file to `len` bytes, leaving
    /// the cursor at the new end.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.staged.clear();
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        self.size = len;
        Ok(())
    }

    /// Logical size in bytes, staged bytes included.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_staged(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.staged)
            .map_err(|e| crate::error::Error::IO(format!("append {}: {e}", self.path.display())))?;
        self.staged.clear();
        Ok(())
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_append_below_threshold_stays_staged() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        let mut appender = Appender::open(&path, 1024).expect("Failed to open appender");
        appender.append(b"hello").expect("append failed");

        assert_eq!(appender.size(), 5);
        // Nothing hit the disk yet.
        assert_eq!(std::fs::metadata(&path).expect("stat failed").len(), 0);

        appender.flush().expect("flush failed");
        assert_eq!(std::fs::read(&path).expect("read failed"), b"hello");
    }

    #[test]
    fn test_threshold_triggers_write() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        let mut appender = Appender::open(&path, 8).expect("Failed to open appender");
        appender.append(b"0123").expect("append failed");
        appender.append(b"4567").expect("append failed");

        // 8 staged bytes reached the threshold and were written through.
        assert_eq!(std::fs::read(&path).expect("read failed"), b"01234567");
    }

    #[test]
    fn test_byte_order_preserved_across_flushes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        let mut appender = Appender::open(&path, 4).expect("Failed to open appender");
        for chunk in [&b"aa"[..], b"bb", b"cc", b"dd", b"e"] {
            appender.append(chunk).expect("append failed");
        }
        appender.flush().expect("flush failed");

        assert_eq!(std::fs::read(&path).expect("read failed"), b"aabbccdde");
    }

    #[test]
    fn test_reopen_appends_at_end() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        {
            let mut appender = Appender::open(&path, 16).expect("Failed to open appender");
            appender.append(b"first").expect("append failed");
            appender.flush().expect("flush failed");
        }
        {
            let mut appender = Appender::open(&path, 16).expect("Failed to reopen appender");
            assert_eq!(appender.size(), 5);
            appender.append(b"|second").expect("append failed");
            appender.flush().expect("flush failed");
        }

        assert_eq!(std::fs::read(&path).expect("read failed"), b"first|second");
    }

    #[test]
    fn test_drop_flushes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        {
            let mut appender = Appender::open(&path, 1024).expect("Failed to open appender");
            appender.append(b"pending").expect("append failed");
        }
        assert_eq!(std::fs::read(&path).expect("read failed"), b"pending");
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.file("append.log");

        let mut appender = Appender::open(&path, 4).expect("Failed to open appender");
        appender.append(b"prefix|records").expect("append failed");
        appender.flush().expect("flush failed");

        appender.truncate(7).expect("truncate failed");
        appender.append(b"new").expect("append failed");
        appender.flush().expect("flush failed");

        assert_eq!(std::fs::read(&path).expect("read failed"), b"prefix|new");
        assert_eq!(appender.size(), 10);
    }
}
