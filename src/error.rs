//! Error taxonomy for the download pipeline.
//!
//! Library code returns [`Error`]; the binary wraps it in `anyhow` for
//! top-level reporting. Every variant maps onto one failure class:
//!
//! - [`Error::Transport`] - HTTP or network failure while fetching
//! - [`Error::MalformedInput`] - unparseable JSON/CSV, non-finite numbers,
//!   conflicting column types
//! - [`Error::Filesystem`] - permission, space, or path problems
//! - [`Error::Configuration`] - bad CLI input, missing environment variables,
//!   invalid endpoint definitions
//!
//! [`Error::Stage`] and [`Error::Aggregate`] carry orchestration context and
//! are produced only by [`crate::pipeline`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Transcode,
    Table,
    Compress,
    Place,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Download => "download",
            Self::Transcode => "transcode",
            Self::Table => "table",
            Self::Compress => "compress",
            Self::Place => "place",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("malformed input ({context}): {message}")]
    MalformedInput { context: String, message: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dataset {dataset} failed during {stage}: {source}")]
    Stage {
        dataset: String,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("{} dataset(s) failed: {}", failed.len(), failed.join(", "))]
    Aggregate { failed: Vec<String> },
}

impl Error {
    pub fn transport(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn malformed(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::MalformedInput {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn fs(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Attach dataset and stage context, unless already attached.
    #[must_use]
    pub fn at_stage(self, dataset: &str, stage: Stage) -> Self {
        match self {
            e @ Self::Stage { .. } => e,
            other => Self::Stage {
                dataset: dataset.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping stage context.
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Self::Transport { .. })
    }

    pub fn is_malformed_input(&self) -> bool {
        matches!(self.root(), Self::MalformedInput { .. })
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(self.root(), Self::Filesystem { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Self::Configuration(_))
    }
}

/// Extension for mapping `io::Result` onto [`Error::Filesystem`] with a path.
pub(crate) trait IoResultExt<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| Error::fs(path, e))
    }
}
