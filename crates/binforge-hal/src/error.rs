use std::path::PathBuf;

/// Load-time failure text fragments that a rebuild can plausibly fix: the
/// binary is stale, truncated or built for another machine class.
pub const RECOVERABLE_MARKERS: &[&str] = &[
    "binary interface mismatch",
    "undefined symbol",
    "symbol not found",
    "wrong elf class",
    "invalid elf header",
    "cannot open shared object file",
    "file too short",
];

/// Why an engine could not be linked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("binary not found: {0}")]
    BinaryNotFound(PathBuf),

    /// Eligible for one self-repair build.
    #[error("recoverable link error: {0}")]
    Recoverable(String),

    #[error("link error: {0}")]
    Fatal(String),
}

impl LinkError {
    /// Classify a loader error message against [`RECOVERABLE_MARKERS`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if RECOVERABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            LinkError::Recoverable(message)
        } else {
            LinkError::Fatal(message)
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, LinkError::Recoverable(_))
    }
}

/// Why one engine read produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("engine '{0}' is not linked")]
    NotLinked(String),

    /// The native call returned a non-zero status.
    #[error("engine '{engine}' read failed with status {status}")]
    Failed { engine: String, status: i32 },

    #[error("engine '{engine}' returned malformed data: {reason}")]
    Malformed { engine: String, reason: String },
}
