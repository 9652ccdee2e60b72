//! Runtime identity: the fingerprint of this process and the cache key
//! derived from it.
//!
//! | Field | Source |
//! |---|---|
//! | `runtime_version` | `major.minor` of the host crate version |
//! | `binary_interface_tag` | `fbabi<ENGINE_ABI_VERSION>-<target_env>` |
//! | `os_family` | `std::env::consts::OS` |
//! | `cpu_arch` | `std::env::consts::ARCH` |

use std::sync::OnceLock;

use binforge_types::{ENGINE_ABI_VERSION, RuntimeFingerprint};

use crate::manifest::Manifest;

const KEY_PREFIX: &str = "fb";

static FINGERPRINT: OnceLock<RuntimeFingerprint> = OnceLock::new();

/// Fingerprint of the running process. Computed on first use.
pub fn fingerprint() -> &'static RuntimeFingerprint {
    FINGERPRINT.get_or_init(compute_fingerprint)
}

fn compute_fingerprint() -> RuntimeFingerprint {
    RuntimeFingerprint {
        runtime_version: runtime_version(env!("CARGO_PKG_VERSION")),
        binary_interface_tag: format!("fbabi{ENGINE_ABI_VERSION}-{}", target_env()),
        os_family: std::env::consts::OS.to_string(),
        cpu_arch: std::env::consts::ARCH.to_string(),
    }
}

fn runtime_version(pkg_version: &str) -> String {
    let mut parts = pkg_version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => pkg_version.to_string(),
    }
}

fn target_env() -> &'static str {
    if cfg!(target_env = "gnu") {
        "gnu"
    } else if cfg!(target_env = "musl") {
        "musl"
    } else if cfg!(target_env = "msvc") {
        "msvc"
    } else {
        "none"
    }
}

/// Cache key of the running process.
pub fn cache_key() -> String {
    cache_key_for(fingerprint())
}

/// Cache key for an arbitrary fingerprint.
///
/// The result only contains `[A-Za-z0-9_.-]` and is safe to use as a single
/// directory segment.
pub fn cache_key_for(fp: &RuntimeFingerprint) -> String {
    let tag = if fp.binary_interface_tag.is_empty() {
        "no-abi"
    } else {
        fp.binary_interface_tag.as_str()
    };
    let raw = format!(
        "{KEY_PREFIX}{}-{}-{}-{}",
        fp.runtime_version, tag, fp.os_family, fp.cpu_arch
    );
    sanitize(&raw)
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `true` when `manifest` may describe binaries built for this process.
pub fn manifest_compatible(manifest: &Manifest) -> bool {
    manifest_compatible_with(manifest, fingerprint())
}

/// Field-wise comparison, trimmed and case-insensitive. A field the manifest
/// does not record (or records as blank) matches anything.
pub fn manifest_compatible_with(manifest: &Manifest, fp: &RuntimeFingerprint) -> bool {
    let pairs = [
        (&manifest.runtime_version, &fp.runtime_version),
        (&manifest.binary_interface_tag, &fp.binary_interface_tag),
        (&manifest.os_family, &fp.os_family),
        (&manifest.cpu_arch, &fp.cpu_arch),
    ];
    pairs.into_iter().all(|(recorded, current)| match recorded {
        Some(value) if !value.trim().is_empty() => {
            value.trim().to_lowercase() == current.trim().to_lowercase()
        }
        _ => true,
    })
}
