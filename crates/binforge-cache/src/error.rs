//! Error types for cache and loader operations.

use std::path::PathBuf;

/// Low-level failures while reading or writing cache files.
///
/// Most cache reads are fail-safe and turn into a miss instead of one of
/// these; the variants surface when a write the caller asked for fails.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A JSON document could not be encoded.
    #[error("serialization error at {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single engine could not be resolved to a loadable binary.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The engine has no source file in the source directory.
    #[error("no source for engine '{engine}' at {path}")]
    SourceNotFound { engine: String, path: PathBuf },

    /// The compiler or an include directory could not be found.
    #[error("toolchain unavailable: {reason}")]
    ToolchainUnavailable { reason: String },

    /// The compiler ran and rejected the source.
    #[error("build of '{engine}' failed:\n{diagnostics}")]
    BuildFailed { engine: String, diagnostics: String },

    /// `prebuilt_only` found nothing usable in the durable store.
    #[error("no compatible prebuilt binary for '{engine}'")]
    NoCompatiblePrebuilt { engine: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}
