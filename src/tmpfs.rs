//! Scratch directories for filesystem tests. Each test gets a uniquely
//! named directory under the system temp root to hold a throwaway engine
//! file set; the directory and everything in it vanish when the handle
//! drops.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

static NEXT_DIR: AtomicU64 = AtomicU64::new(0);

pub struct TempDir {
    root: PathBuf,
}

impl TempDir {
    /// Creates a fresh scratch directory. The name combines the process id
    /// with a process-local counter, so concurrent tests never collide; a
    /// stale directory left by a crashed earlier run is cleared first.
    pub fn new() -> Result<Self> {
        let seq = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        let root =
            std::env::temp_dir().join(format!("shaledb-test-{}-{seq}", std::process::id()));

        if root.exists() {
            fs::remove_dir_all(&root)
                .map_err(|e| crate::error::Error::IO(format!("clear {}: {e}", root.display())))?;
        }
        fs::create_dir_all(&root)
            .map_err(|e| crate::error::Error::IO(format!("create {}: {e}", root.display())))?;

        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the scratch directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
