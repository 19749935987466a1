//! Error types shared by the config and work-estimate loaders.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while loading the cluster config or work estimates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is syntactically malformed or an entry is missing.
    #[error("parse error in {path} (line {line}): {message}")]
    Parse {
        path: PathBuf,
        /// 1-based line number, `0` when the position is unknown.
        line: usize,
        message: String,
    },

    /// The file parsed but its contents are inconsistent with the run.
    #[error("config error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        CoreError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Whether this error came from malformed input rather than bad values.
    pub fn is_parse(&self) -> bool {
        matches!(self, CoreError::Parse { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, CoreError::Config(_))
    }
}
