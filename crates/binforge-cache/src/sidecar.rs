//! Binary-interface sidecars (`<binary>.abi.json`).

use std::path::{Path, PathBuf};

use binforge_types::{BuildSignature, RuntimeFingerprint};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;

pub const SIDECAR_SUFFIX: &str = ".abi.json";

/// Fingerprint at build time plus the inputs of the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSidecar {
    #[serde(flatten)]
    pub fingerprint: RuntimeFingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_signature: Option<BuildSignature>,
}

/// `<dir>/cpu.so` → `<dir>/cpu.so.abi.json`
pub fn sidecar_path(binary: &Path) -> PathBuf {
    let mut name = binary.file_name().unwrap_or_default().to_os_string();
    name.push(SIDECAR_SUFFIX);
    binary.with_file_name(name)
}

impl InterfaceSidecar {
    pub fn new(fingerprint: &RuntimeFingerprint, signature: Option<&BuildSignature>) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            build_signature: signature.cloned(),
        }
    }

    /// Sidecar of `binary`, or `None` when it is missing or unreadable.
    pub fn read(binary: &Path) -> Option<Self> {
        let path = sidecar_path(binary);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable sidecar");
                None
            }
        }
    }

    pub fn write(&self, binary: &Path) -> Result<(), CacheError> {
        let path = sidecar_path(binary);
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| CacheError::io(&path, e))
    }

    /// Exact fingerprint match and, when `signature` is given, an exact
    /// signature match.
    pub fn matches(&self, fp: &RuntimeFingerprint, signature: Option<&BuildSignature>) -> bool {
        if &self.fingerprint != fp {
            return false;
        }
        match signature {
            Some(wanted) => self.build_signature.as_ref() == Some(wanted),
            None => true,
        }
    }
}

/// `true` when `binary` has a sidecar that [`InterfaceSidecar::matches`].
pub fn is_interface_compatible(
    binary: &Path,
    fp: &RuntimeFingerprint,
    signature: Option<&BuildSignature>,
) -> bool {
    InterfaceSidecar::read(binary).is_some_and(|s| s.matches(fp, signature))
}
