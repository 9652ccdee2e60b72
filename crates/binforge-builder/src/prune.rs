//! Retention policy for durable-store version directories.
//!
//! Directories directly under the store root (one per cache key) are ranked
//! by modification time, newest first. A directory is removed when its rank
//! is at least `max_versions` **or** it is older than `max_age_days`. Loose
//! files at the root (plain binaries, the manifest) are never touched.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use binforge_middleware::{EventBus, Topic};
use binforge_types::Level;
use serde::Serialize;
use tracing::{debug, info};

pub const DEFAULT_MAX_VERSIONS: usize = 3;
pub const DEFAULT_MAX_AGE_DAYS: u64 = 30;

const SOURCE: &str = "binforge-builder::prune";
const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

/// Split `(dir, mtime)` entries into `(remove, keep)`.
pub fn plan(
    mut entries: Vec<(PathBuf, SystemTime)>,
    max_versions: usize,
    max_age_days: Option<u64>,
    now: SystemTime,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let max_age = max_age_days.map(|days| DAY * u32::try_from(days).unwrap_or(u32::MAX));

    let mut remove = Vec::new();
    let mut keep = Vec::new();
    for (rank, (dir, modified)) in entries.into_iter().enumerate() {
        let age = now.duration_since(modified).unwrap_or_default();
        let too_many = rank >= max_versions;
        let too_old = max_age.is_some_and(|limit| age > limit);
        if too_many || too_old {
            remove.push(dir);
        } else {
            keep.push(dir);
        }
    }
    (remove, keep)
}

fn version_dirs(root: &Path) -> Vec<(PathBuf, SystemTime)> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_dir() {
                return None;
            }
            Some((entry.path(), meta.modified().ok()?))
        })
        .collect()
}

/// [`prune_at`] measured against the current time.
pub fn prune(
    root: &Path,
    max_versions: usize,
    max_age_days: Option<u64>,
    dry_run: bool,
    bus: &EventBus,
) -> PruneReport {
    prune_at(root, max_versions, max_age_days, dry_run, SystemTime::now(), bus)
}

/// Apply the retention policy to `root` with ages measured against `now`.
///
/// Removal is best-effort: a directory that cannot be deleted is still
/// reported as removed and the batch continues.
pub fn prune_at(
    root: &Path,
    max_versions: usize,
    max_age_days: Option<u64>,
    dry_run: bool,
    now: SystemTime,
    bus: &EventBus,
) -> PruneReport {
    if !root.is_dir() {
        debug!(root = %root.display(), "nothing to prune");
        return PruneReport::default();
    }

    let (remove, keep) = plan(version_dirs(root), max_versions, max_age_days, now);
    if !dry_run {
        for dir in &remove {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                debug!(dir = %dir.display(), error = %e, "prune removal failed");
            }
        }
    }

    let report = PruneReport {
        removed: remove.iter().map(|p| p.display().to_string()).collect(),
        kept: keep.iter().map(|p| p.display().to_string()).collect(),
    };
    info!(removed = report.removed.len(), kept = report.kept.len(), dry_run, "prune finished");
    bus.diagnostic(
        Topic::Cache,
        SOURCE,
        Level::Info,
        "cache:prune",
        format!("removed {}, kept {}", report.removed.len(), report.kept.len()),
    );
    report
}
