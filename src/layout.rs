//! Destination directory layout under the sync root.
//!
//! Two schemes are in use:
//!
//! | scheme | directory |
//! |---|---|
//! | [`DirScheme::FormatVersion`] | `root/{name}/{format}_{version}/` |
//! | [`DirScheme::VersionFormat`] | `root/{family}/{name}/{version}/{format}/` |
//!
//! Directory creation is idempotent and tolerates other processes creating
//! the same directories concurrently.

use crate::error::{Error, IoResultExt, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// How artifact directories are arranged under the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirScheme {
    /// `root/{name}/{format}_{version}/`
    FormatVersion,
    /// `root/{family}/{name}/{version}/{format}/`
    VersionFormat { family: String },
}

/// Resolves and creates artifact directories below a sync root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    scheme: DirScheme,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, scheme: DirScheme) -> Self {
        Self {
            root: root.into(),
            scheme,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scheme(&self) -> &DirScheme {
        &self.scheme
    }

    /// Directory for `(name, format, version)`, without touching the disk.
    pub fn dir_for(&self, name: &str, format: &str, version: &str) -> PathBuf {
        match &self.scheme {
            DirScheme::FormatVersion => self.root.join(name).join(format!("{format}_{version}")),
            DirScheme::VersionFormat { family } => {
                self.root.join(family).join(name).join(version).join(format)
            }
        }
    }

    /// Return the directory for `(name, format, version)`, creating it if absent.
    ///
    /// # Errors
    /// Returns [`Error::Filesystem`] if the directory cannot be created or a
    /// non-directory is in the way.
    pub fn ensure_dir(&self, name: &str, format: &str, version: &str) -> Result<PathBuf> {
        let dir = self.dir_for(name, format, version);
        create_dir_idempotent(&dir)?;
        Ok(dir)
    }

    /// Final resting path of `file_name` for `(name, format, version)`,
    /// creating the directory if needed.
    ///
    /// # Errors
    /// See [`Layout::ensure_dir`].
    pub fn artifact_path(
        &self,
        name: &str,
        format: &str,
        version: &str,
        file_name: &str,
    ) -> Result<PathBuf> {
        Ok(self.ensure_dir(name, format, version)?.join(file_name))
    }
}

/// `mkdir -p` that treats "already exists" as success, including when another
/// process wins the race between our check and our create.
///
/// # Errors
/// Returns [`Error::Filesystem`] for any other failure, or if `dir` exists but
/// is not a directory.
pub fn create_dir_idempotent(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(Error::fs(dir, e)),
    }?;
    if fs::metadata(dir).at_path(dir)?.is_dir() {
        Ok(())
    } else {
        Err(Error::fs(
            dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "exists and is not a directory"),
        ))
    }
}
