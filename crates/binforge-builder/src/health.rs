//! Environment checks: `healthcheck` before a build and the runtime
//! compatibility report logged when monitoring starts.

use std::collections::BTreeMap;
use std::path::Path;

use binforge_cache::{cache_key, fingerprint};
use binforge_types::RuntimeFingerprint;
use serde::Serialize;

use crate::layout::ProjectLayout;
use crate::toolchain::{AUXILIARY_RUNTIME, PlatformInfo, find_on_path, platform_info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn new(ok: bool, detail: impl Into<String>) -> Self {
        Self {
            ok,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub runtime: RuntimeFingerprint,
    pub cache_key: String,
    pub platform: PlatformInfo,
    pub checks: BTreeMap<String, Check>,
    pub ok: bool,
}

fn writable(dir: &Path) -> bool {
    dir.ancestors()
        .find(|d| d.exists())
        .and_then(|d| std::fs::metadata(d).ok())
        .is_some_and(|m| !m.permissions().readonly())
}

/// Check that everything a build needs is in place.
pub fn healthcheck(layout: &ProjectLayout, compiler: &str) -> HealthReport {
    let mut checks = BTreeMap::new();
    checks.insert(
        "compiler".to_string(),
        match find_on_path(compiler) {
            Some(path) => Check::new(true, path.display().to_string()),
            None => Check::new(false, format!("{compiler} not found on PATH")),
        },
    );
    checks.insert(
        "include_dir".to_string(),
        Check::new(layout.include_dir.is_dir(), layout.include_dir.display().to_string()),
    );
    checks.insert(
        "source_dir".to_string(),
        Check::new(layout.source_dir.is_dir(), layout.source_dir.display().to_string()),
    );
    checks.insert(
        "cache_root".to_string(),
        Check::new(
            layout.cache_root.is_dir() || writable(&layout.root),
            layout.cache_root.display().to_string(),
        ),
    );
    let ok = checks.values().all(|c| c.ok);
    HealthReport {
        runtime: fingerprint().clone(),
        cache_key: cache_key(),
        platform: platform_info(),
        checks,
        ok,
    }
}

/// Tools whose presence changes which engines can be built or linked.
const OPTIONAL_TOOLS: &[&str] = &["g++", "clang++", "nvidia-smi", AUXILIARY_RUNTIME];

/// Kernel interfaces the bundled engines read from.
const SENSOR_PATHS: &[&str] = &[
    "/proc/stat",
    "/proc/meminfo",
    "/proc/diskstats",
    "/proc/net/dev",
    "/proc/driver/nvidia/version",
    "/sys/class/drm",
    "/sys/class/hwmon",
    "/sys/class/bluetooth",
    "/sys/class/power_supply",
    "/sys/class/powercap",
];

#[derive(Debug, Clone, Serialize)]
pub struct CompatReport {
    pub os: String,
    pub arch: String,
    pub fingerprint: RuntimeFingerprint,
    pub cache_key: String,
    pub tools: BTreeMap<String, bool>,
    pub sensor_paths: BTreeMap<String, bool>,
}

/// What this machine offers to the engines.
pub fn compat_report() -> CompatReport {
    CompatReport {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        fingerprint: fingerprint().clone(),
        cache_key: cache_key(),
        tools: OPTIONAL_TOOLS
            .iter()
            .map(|t| (t.to_string(), find_on_path(t).is_some()))
            .collect(),
        sensor_paths: SENSOR_PATHS
            .iter()
            .map(|p| (p.to_string(), Path::new(p).exists()))
            .collect(),
    }
}
