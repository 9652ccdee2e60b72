//! Workspace cleanup.
//!
//! | Switch | Removes | Default when unset |
//! |---|---|---|
//! | `cache` | the fast cache root | `standard`, `deep` |
//! | `local_outputs` | binaries (and sidecars) next to the sources | always |
//! | `orphans` | binaries next to the sources whose source is gone | always |
//! | `build_artifacts` | `build/`, `dist/`, `CMakeFiles/`, temp/lock/object/log files, `CMakeCache.txt` | `standard`, `deep` |
//! | `bytecode` | `__pycache__/`, `*.pyc`, `*.pyo` | `deep` |
//!
//! Precedence per switch: explicit value, then the profile preset, then the
//! mode default. Excluded paths (and everything below them) are reported as
//! skipped and never touched. A dry run reports the same removal set and byte
//! total without deleting anything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use binforge_middleware::{EventBus, Topic};
use binforge_types::Level;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::layout::ProjectLayout;

const SOURCE: &str = "binforge-builder::clean";

const BINARY_EXTENSIONS: &[&str] = &["so", "dll", "dylib"];
const BUILD_DIRS: &[&str] = &["build", "dist", "CMakeFiles"];
const BUILD_FILE_SUFFIXES: &[&str] = &[".tmp", ".lock", ".o", ".obj", ".a", ".la", ".log"];
const BYTECODE_SUFFIXES: &[&str] = &[".pyc", ".pyo"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanMode {
    Light,
    #[default]
    Standard,
    Deep,
}

impl fmt::Display for CleanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanMode::Light => write!(f, "light"),
            CleanMode::Standard => write!(f, "standard"),
            CleanMode::Deep => write!(f, "deep"),
        }
    }
}

impl FromStr for CleanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(CleanMode::Light),
            "standard" => Ok(CleanMode::Standard),
            "deep" => Ok(CleanMode::Deep),
            other => Err(format!("invalid clean mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanProfile {
    Dev,
    Ci,
    Release,
}

impl fmt::Display for CleanProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanProfile::Dev => write!(f, "dev"),
            CleanProfile::Ci => write!(f, "ci"),
            CleanProfile::Release => write!(f, "release"),
        }
    }
}

impl FromStr for CleanProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(CleanProfile::Dev),
            "ci" => Ok(CleanProfile::Ci),
            "release" => Ok(CleanProfile::Release),
            other => Err(format!("invalid clean profile: {other}")),
        }
    }
}

/// Fully resolved switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanSwitches {
    pub mode: CleanMode,
    pub cache: bool,
    pub local_outputs: bool,
    pub orphans: bool,
    pub build_artifacts: bool,
    pub bytecode: bool,
}

impl CleanProfile {
    pub fn preset(self) -> CleanSwitches {
        match self {
            CleanProfile::Dev => CleanSwitches {
                mode: CleanMode::Light,
                cache: false,
                local_outputs: true,
                orphans: true,
                build_artifacts: false,
                bytecode: false,
            },
            CleanProfile::Ci => CleanSwitches {
                mode: CleanMode::Standard,
                cache: true,
                local_outputs: true,
                orphans: true,
                build_artifacts: true,
                bytecode: true,
            },
            CleanProfile::Release => CleanSwitches {
                mode: CleanMode::Deep,
                cache: true,
                local_outputs: true,
                orphans: true,
                build_artifacts: true,
                bytecode: true,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    pub profile: Option<CleanProfile>,
    pub mode: Option<CleanMode>,
    pub cache: Option<bool>,
    pub local_outputs: Option<bool>,
    pub orphans: Option<bool>,
    pub build_artifacts: Option<bool>,
    pub bytecode: Option<bool>,
    pub exclude: Vec<PathBuf>,
    pub dry_run: bool,
}

impl CleanOptions {
    pub fn resolve(&self) -> CleanSwitches {
        let preset = self.profile.map(CleanProfile::preset);
        let mode = self
            .mode
            .or(preset.map(|p| p.mode))
            .unwrap_or_default();
        let heavy = matches!(mode, CleanMode::Standard | CleanMode::Deep);
        CleanSwitches {
            mode,
            cache: self.cache.or(preset.map(|p| p.cache)).unwrap_or(heavy),
            local_outputs: self
                .local_outputs
                .or(preset.map(|p| p.local_outputs))
                .unwrap_or(true),
            orphans: self.orphans.or(preset.map(|p| p.orphans)).unwrap_or(true),
            build_artifacts: self
                .build_artifacts
                .or(preset.map(|p| p.build_artifacts))
                .unwrap_or(heavy),
            bytecode: self
                .bytecode
                .or(preset.map(|p| p.bytecode))
                .unwrap_or(mode == CleanMode::Deep),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub removed: Vec<String>,
    pub missing: Vec<String>,
    pub skipped: Vec<String>,
    pub bytes_freed: u64,
    pub profile: String,
    pub mode: CleanMode,
    pub dry_run: bool,
}

struct Sweeper {
    exclude: Vec<PathBuf>,
    dry_run: bool,
    handled: Vec<PathBuf>,
    report: CleanReport,
}

impl Sweeper {
    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|ex| path.starts_with(ex))
    }

    fn remove(&mut self, path: &Path) {
        if self.handled.iter().any(|done| path.starts_with(done)) {
            return;
        }
        self.handled.push(path.to_path_buf());
        let shown = path.display().to_string();

        if self.is_excluded(path) {
            self.report.skipped.push(shown);
            return;
        }
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            self.report.missing.push(shown);
            return;
        };
        let size = if meta.is_dir() { dir_size(path) } else { meta.len() };
        if !self.dry_run {
            let result = if meta.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            if let Err(e) = result {
                warn!(path = %shown, error = %e, "could not remove");
                self.report.skipped.push(shown);
                return;
            }
        }
        self.report.removed.push(shown);
        self.report.bytes_freed += size;
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn local_binaries(source_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(source_dir) else {
        return Vec::new();
    };
    let mut binaries: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| BINARY_EXTENSIONS.contains(&e))
        })
        .collect();
    binaries.sort();
    binaries
}

/// `cpu.so` → `cpu`, `cpu.x86_64.so` → `cpu`
fn engine_base(binary: &Path) -> String {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

/// Files and directories under `root` whose name matches `pred`, skipping
/// `.git`. Matching directories are not descended into.
fn walk_matching(root: &Path, pred: impl Fn(&str, bool) -> bool) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy();
        let is_dir = entry.file_type().is_dir();
        if is_dir && name == ".git" {
            walker.skip_current_dir();
            continue;
        }
        if pred(&name, is_dir) {
            found.push(entry.path().to_path_buf());
            if is_dir {
                walker.skip_current_dir();
            }
        }
    }
    found
}

fn is_build_byproduct(name: &str, is_dir: bool) -> bool {
    if is_dir {
        return false;
    }
    name == "CMakeCache.txt"
        || name.contains(".tmp.")
        || BUILD_FILE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn is_bytecode(name: &str, is_dir: bool) -> bool {
    if is_dir {
        name == "__pycache__"
    } else {
        BYTECODE_SUFFIXES.iter().any(|s| name.ends_with(s))
    }
}

/// Clean the project described by `layout`.
pub fn clean(layout: &ProjectLayout, opts: &CleanOptions, bus: &EventBus) -> CleanReport {
    let switches = opts.resolve();
    let source_dir = normalize(&layout.source_dir);
    let root = normalize(&layout.root);

    let mut sweeper = Sweeper {
        exclude: opts.exclude.iter().map(|p| normalize(p)).collect(),
        dry_run: opts.dry_run,
        handled: Vec::new(),
        report: CleanReport {
            profile: opts.profile.map(|p| p.to_string()).unwrap_or_default(),
            mode: switches.mode,
            dry_run: opts.dry_run,
            ..CleanReport::default()
        },
    };

    if switches.cache {
        sweeper.remove(&normalize(&layout.cache_root));
    }

    if switches.local_outputs {
        for binary in local_binaries(&source_dir) {
            let sidecar = binforge_cache::sidecar::sidecar_path(&binary);
            sweeper.remove(&binary);
            if sidecar.exists() {
                sweeper.remove(&sidecar);
            }
        }
    }

    if switches.orphans {
        let engines = crate::discovery::discover_units(&source_dir).unwrap_or_default();
        for binary in local_binaries(&source_dir) {
            let base = engine_base(&binary);
            if !base.is_empty() && !engines.contains(&base) {
                sweeper.remove(&binary);
            }
        }
    }

    if switches.build_artifacts {
        for dir in BUILD_DIRS {
            let path = root.join(dir);
            if path.exists() {
                sweeper.remove(&path);
            }
        }
        for path in walk_matching(&root, is_build_byproduct) {
            sweeper.remove(&path);
        }
    }

    if switches.bytecode {
        for path in walk_matching(&root, is_bytecode) {
            sweeper.remove(&path);
        }
    }

    let report = sweeper.report;
    info!(
        mode = %report.mode,
        removed = report.removed.len(),
        missing = report.missing.len(),
        skipped = report.skipped.len(),
        bytes_freed = report.bytes_freed,
        dry_run = report.dry_run,
        "cleanup finished"
    );
    bus.diagnostic(
        Topic::Build,
        SOURCE,
        Level::Info,
        "builder:clean",
        format!(
            "removed {} path(s), {} bytes{}",
            report.removed.len(),
            report.bytes_freed,
            if report.dry_run { " (dry run)" } else { "" }
        ),
    );
    report
}
