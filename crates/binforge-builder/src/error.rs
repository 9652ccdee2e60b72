use std::path::PathBuf;

use binforge_cache::CacheError;

/// Directory-level failures of a batch operation.
///
/// Per-engine failures never surface here; they are collected into the
/// batch report instead.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("source directory {0} does not exist")]
    SourceDirMissing(PathBuf),

    #[error("script {0} does not exist")]
    ScriptNotFound(PathBuf),

    #[error("unsupported script type: {0}")]
    UnsupportedScript(PathBuf),

    #[error("no JavaScript runtime found (node, bun or deno)")]
    NoScriptRuntime,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl BuilderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuilderError::Io {
            path: path.into(),
            source,
        }
    }
}
