//! Scoped scratch directory of one pipeline run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PREFIX: &str = ".mainiac_";

/// Directory owning the intermediate files of one pipeline run.
///
/// The directory is removed when the value is dropped, including when the
/// pipeline unwinds. Call [`Workspace::retain`] to leave it on disk.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace inside `parent`.
    pub fn create_in(parent: &Path) -> io::Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(parent)?;
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Keep the directory on disk and return its path.
    pub fn retain(self) -> PathBuf {
        self.dir.keep()
    }

    /// Remove the directory, reporting any error.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }

    /// Copy every file of the workspace into `dest`, creating it if needed.
    /// Existing files of the same name are replaced.
    pub fn copy_contents(&self, dest: &Path) -> io::Result<usize> {
        fs::create_dir_all(dest)?;
        let mut copied = 0;
        for entry in fs::read_dir(self.path())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), dest.join(entry.file_name()))?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}
