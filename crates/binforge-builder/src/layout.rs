//! Project layout.
//!
//! The project root is the first ancestor of the source directory that
//! contains `assets/` or `binforge.toml`; failing that, the source
//! directory's parent.
//!
//! ```text
//! <root>/
//!   binforge.toml            (optional marker)
//!   include/                 engine ABI header
//!   assets/binaries/         durable store
//!   .binforge/cache/         fast cache
//!   .binforge/toolchains/    toolchain snapshots, one per cache key
//! ```

use std::path::{Path, PathBuf};

pub const PROJECT_MARKER: &str = "binforge.toml";
pub const STATE_DIR: &str = ".binforge";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub source_dir: PathBuf,
    pub cache_root: PathBuf,
    pub prebuilt_root: PathBuf,
    pub toolchain_dir: PathBuf,
    pub include_dir: PathBuf,
}

impl ProjectLayout {
    /// Layout with every location derived from the detected project root.
    pub fn discover(source_dir: &Path) -> Self {
        let source_dir = absolute(source_dir);
        let root = detect_project_root(&source_dir);
        Self {
            cache_root: root.join(STATE_DIR).join("cache"),
            prebuilt_root: root.join("assets").join("binaries"),
            toolchain_dir: root.join(STATE_DIR).join("toolchains"),
            include_dir: root.join("include"),
            source_dir,
            root,
        }
    }

    pub fn with_cache_root(mut self, cache_root: Option<PathBuf>) -> Self {
        if let Some(dir) = cache_root {
            self.cache_root = dir;
        }
        self
    }

    pub fn with_prebuilt_root(mut self, prebuilt_root: Option<PathBuf>) -> Self {
        if let Some(dir) = prebuilt_root {
            self.prebuilt_root = dir;
        }
        self
    }

    /// Include directories handed to the compiler: the project `include/`
    /// when present, nothing otherwise.
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        if self.include_dir.is_dir() {
            vec![self.include_dir.clone()]
        } else {
            Vec::new()
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

pub fn detect_project_root(source_dir: &Path) -> PathBuf {
    source_dir
        .ancestors()
        .find(|dir| dir.join("assets").is_dir() || dir.join(PROJECT_MARKER).is_file())
        .map(Path::to_path_buf)
        .or_else(|| source_dir.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| source_dir.to_path_buf())
}
