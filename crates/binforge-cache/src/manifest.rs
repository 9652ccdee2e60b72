//! Per-directory cache manifest.
//!
//! Stored as `manifest.json` inside a cache-root or durable-store directory.
//! Records the fingerprint that produced the binaries next to it and the
//! SHA-256 of each binary by file name:
//!
//! ```json
//! { "runtime_version": "0.1", "binary_interface_tag": "fbabi1-gnu",
//!   "os_family": "linux", "cpu_arch": "x86_64",
//!   "hashes": { "cpu.so": "9f86d0…" } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use binforge_types::RuntimeFingerprint;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CacheError;
use crate::hash::sha256_file;

/// Name of the manifest file within a cache directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Fingerprint fields are optional: an absent field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_interface_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl Manifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Loads the manifest of `dir`.
    ///
    /// Fail-safe: a missing file yields an empty manifest, and so does a
    /// malformed one (with a warning). Neither case is an error.
    pub fn load(dir: &Path) -> Self {
        let path = Self::path_in(dir);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt manifest treated as absent");
                Self::default()
            }
        }
    }

    /// Saves the manifest into `dir`, creating the directory if needed.
    ///
    /// The JSON goes to a sibling temp file first and is renamed over the
    /// live manifest, so readers see either the old or the new one.
    pub fn save(&self, dir: &Path) -> Result<(), CacheError> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        let path = Self::path_in(dir);
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp.{}", std::process::id()));
        std::fs::write(&tmp, json).map_err(|e| CacheError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CacheError::io(&path, e)
        })
    }

    /// `true` when no fingerprint field and no hash is recorded.
    pub fn is_empty(&self) -> bool {
        self.runtime_version.is_none()
            && self.binary_interface_tag.is_none()
            && self.os_family.is_none()
            && self.cpu_arch.is_none()
            && self.hashes.is_empty()
    }

    /// Overwrite the fingerprint fields with `fp`.
    pub fn stamp(&mut self, fp: &RuntimeFingerprint) {
        self.runtime_version = Some(fp.runtime_version.clone());
        self.binary_interface_tag = Some(fp.binary_interface_tag.clone());
        self.os_family = Some(fp.os_family.clone());
        self.cpu_arch = Some(fp.cpu_arch.clone());
    }

    pub fn recorded_hash(&self, file_name: &str) -> Option<&str> {
        self.hashes.get(file_name).map(String::as_str)
    }

    /// Merge `fp` into the manifest of `binary`'s directory and set the
    /// content hash for `binary`'s file name.
    pub fn upsert(binary: &Path, fp: &RuntimeFingerprint) -> Result<Self, CacheError> {
        let dir = binary.parent().unwrap_or(Path::new("."));
        let file_name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut manifest = Self::load(dir);
        manifest.stamp(fp);
        manifest.hashes.insert(file_name, sha256_file(binary)?);
        manifest.save(dir)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex;

    fn fp() -> RuntimeFingerprint {
        RuntimeFingerprint {
            runtime_version: "0.1".to_string(),
            binary_interface_tag: "fbabi1-gnu".to_string(),
            os_family: "linux".to_string(),
            cpu_arch: "x86_64".to_string(),
        }
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_manifest_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        assert_eq!(Manifest::load(dir.path()), Manifest::default());

        std::fs::write(dir.path().join(MANIFEST_FILE), "[1, 2, 3]").unwrap();
        assert!(Manifest::load(dir.path()).is_empty());
    }

    #[test]
    fn partial_manifest_keeps_absent_fields_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"os_family":"linux"}"#).unwrap();
        let manifest = Manifest::load(dir.path());
        assert_eq!(manifest.os_family.as_deref(), Some("linux"));
        assert!(manifest.cpu_arch.is_none());
        assert!(manifest.hashes.is_empty());
    }

    #[test]
    fn save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut manifest = Manifest::default();
        manifest.stamp(&fp());
        manifest.save(&nested).unwrap();
        assert_eq!(Manifest::load(&nested), manifest);
    }

    #[test]
    fn save_replaces_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        manifest.hashes.insert("cpu.so".to_string(), "aa".to_string());
        manifest.save(dir.path()).unwrap();
        manifest.hashes.insert("cpu.so".to_string(), "bb".to_string());
        manifest.save(dir.path()).unwrap();

        assert_eq!(Manifest::load(dir.path()).recorded_hash("cpu.so"), Some("bb"));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MANIFEST_FILE]);
    }

    #[test]
    fn upsert_merges_and_replaces_hash() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("ram.so");
        std::fs::write(&other, b"ram").unwrap();
        Manifest::upsert(&other, &fp()).unwrap();

        let binary = dir.path().join("cpu.so");
        std::fs::write(&binary, b"v1").unwrap();
        Manifest::upsert(&binary, &fp()).unwrap();
        std::fs::write(&binary, b"v2").unwrap();
        let manifest = Manifest::upsert(&binary, &fp()).unwrap();

        assert_eq!(manifest.recorded_hash("cpu.so"), Some(sha256_hex(b"v2").as_str()));
        assert_eq!(manifest.recorded_hash("ram.so"), Some(sha256_hex(b"ram").as_str()));
        assert_eq!(manifest.os_family.as_deref(), Some("linux"));
        assert_eq!(Manifest::load(dir.path()), manifest);
    }
}
