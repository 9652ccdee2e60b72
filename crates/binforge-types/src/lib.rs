use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Version of the C interface every native engine must export.
///
/// Bumped whenever the layout of the engine descriptor changes; a binary
/// reporting a different value is rejected as a binary-interface mismatch.
pub const ENGINE_ABI_VERSION: u32 = 1;

/// Runtime/platform facts that decide whether a compiled engine is safe to load.
///
/// Computed once per process; serialized field names are shared by the
/// manifest, the interface sidecar, and the toolchain snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeFingerprint {
    pub runtime_version: String,
    pub binary_interface_tag: String,
    pub os_family: String,
    pub cpu_arch: String,
}

/// Inputs that produced a binary, stamped into its interface sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSignature {
    pub source_hash: String,
    pub compiler_id: String,
    pub language_standard: String,
    #[serde(default)]
    pub extra_compile_flags: Vec<String>,
    #[serde(default)]
    pub extra_link_flags: Vec<String>,
}

/// Order in which the loader consults the durable store, the fast cache and
/// the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// durable (key-scoped) → durable (plain) → fast cache → build
    #[default]
    PreferPrebuilt,
    /// fast cache → durable (key-scoped, plain) → build
    PreferCache,
    /// always build
    BuildOnly,
    /// durable store only, never build
    PrebuiltOnly,
}

impl LoadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPolicy::PreferPrebuilt => "prefer_prebuilt",
            LoadPolicy::PreferCache => "prefer_cache",
            LoadPolicy::BuildOnly => "build_only",
            LoadPolicy::PrebuiltOnly => "prebuilt_only",
        }
    }
}

impl fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadPolicy {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "prefer_prebuilt" => Ok(LoadPolicy::PreferPrebuilt),
            "prefer_cache" => Ok(LoadPolicy::PreferCache),
            "build_only" => Ok(LoadPolicy::BuildOnly),
            "prebuilt_only" => Ok(LoadPolicy::PrebuiltOnly),
            other => Err(ForgeError::InvalidPolicy(other.to_string())),
        }
    }
}

/// How a resolved artifact came to be at its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    UpToDate,
    Restored,
    Rebuilt,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::UpToDate => write!(f, "up_to_date"),
            ArtifactStatus::Restored => write!(f, "restored"),
            ArtifactStatus::Rebuilt => write!(f, "rebuilt"),
        }
    }
}

/// The closed set of call shapes a native engine can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// One read operation returning a single value (e.g. CPU load %).
    Scalar,
    /// One read operation returning a labelled channel map (e.g. per-disk load).
    MultiChannel,
}

/// A value produced by one engine poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Scalar(f64),
    Channels(BTreeMap<String, f64>),
}

impl Reading {
    /// `true` when the reading carries no data (an empty channel map or a
    /// non-finite scalar).
    pub fn is_empty(&self) -> bool {
        match self {
            Reading::Scalar(v) => !v.is_finite(),
            Reading::Channels(map) => map.is_empty(),
        }
    }
}

/// Severity attached to a diagnostic on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// Unified event wrapper for the build/link event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "binforge-cache::loader"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Free-form build/load diagnostic, `code` like `"builder:partial"`.
    Diagnostic {
        level: Level,
        code: String,
        message: String,
    },
    /// An engine binary is in place at `path`.
    ArtifactReady {
        engine: String,
        path: String,
        status: ArtifactStatus,
    },
    /// Loading an engine into the host failed.
    LinkFault {
        engine: String,
        error: String,
        recoverable: bool,
    },
    /// The watchdog repaired an engine, possibly by substituting `replacement`.
    EngineHealed {
        engine: String,
        replacement: Option<String>,
    },
    /// The watchdog gave up on an engine until the next qualifying failure.
    EngineDegraded { engine: String, streak: u32 },
    /// One poll tick worth of readings.
    Telemetry(BTreeMap<String, Reading>),
}

/// Cross-crate error type for configuration and channel failures.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ForgeError {
    #[error("Invalid load policy: {0}")]
    InvalidPolicy(String),

    #[error("Event bus error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}
