//! Environment detection: which engines does this machine need?
//!
//! Every check is independent and appends at most one engine. An engine is
//! only listed when its binary already exists; a satisfied check without a
//! binary logs a warning instead.
//!
//! | Engine | Prerequisite |
//! |---|---|
//! | `cpu`, `ram`, `disc` | none |
//! | `gpu_nvidia` | NVIDIA driver node present |
//! | `gpu_others` | DRM card with a load counter, or NVIDIA fallback with `card0` |
//! | `gpu_temp` | any readable GPU or hwmon `temp*_input` |
//! | `net` | `/proc/net/dev` readable |
//! | `bt` | `/sys/class/bluetooth` directory |
//! | `psu` | power supply, powercap or hwmon class directory |

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Filesystem root the checks look under; `/` on a real host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysRoot {
    root: PathBuf,
}

impl Default for SysRoot {
    fn default() -> Self {
        Self::host()
    }
}

impl SysRoot {
    pub fn host() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an absolute system path under this root.
    pub fn path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    fn exists(&self, absolute: &str) -> bool {
        self.path(absolute).exists()
    }

    fn readable(&self, absolute: &str) -> bool {
        File::open(self.path(absolute)).is_ok()
    }

    fn is_dir(&self, absolute: &str) -> bool {
        self.path(absolute).is_dir()
    }
}

fn entries_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .map(|e| e.path())
        .collect();
    found.sort();
    found
}

/// `<hwmon_class>/hwmon*/temp*_input`, readable.
fn has_temp_input(hwmon_class: &Path) -> bool {
    entries_with_prefix(hwmon_class, "hwmon").iter().any(|hwmon| {
        entries_with_prefix(hwmon, "temp").iter().any(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with("_input"))
                && File::open(p).is_ok()
        })
    })
}

fn nvidia_present(sys: &SysRoot) -> bool {
    sys.exists("/proc/driver/nvidia/version") || sys.exists("/dev/nvidia0")
}

fn generic_gpu_present(sys: &SysRoot) -> bool {
    sys.readable("/sys/class/drm/card0/device/gpu_busy_percent")
        || sys.readable("/sys/class/drm/card1/device/gpu_busy_percent")
        || sys.readable("/sys/class/drm/card0/device/usage")
        || sys.exists("/sys/class/drm/card0")
}

fn gpu_temp_present(sys: &SysRoot) -> bool {
    entries_with_prefix(&sys.path("/sys/class/drm"), "card")
        .iter()
        .any(|card| has_temp_input(&card.join("device").join("hwmon")))
        || has_temp_input(&sys.path("/sys/class/hwmon"))
}

fn psu_present(sys: &SysRoot) -> bool {
    sys.exists("/sys/class/power_supply")
        || sys.exists("/sys/class/powercap")
        || sys.exists("/sys/class/hwmon")
}

/// Ordered list of engines to link on this machine.
pub fn discover_required_engines(sys: &SysRoot, binary_exists: impl Fn(&str) -> bool) -> Vec<String> {
    let mut engines = Vec::new();
    let push = |engine: &str, engines: &mut Vec<String>| {
        if binary_exists(engine) {
            engines.push(engine.to_string());
            true
        } else {
            warn!(engine, "prerequisite satisfied but no compiled binary");
            false
        }
    };

    for engine in ["cpu", "ram", "disc"] {
        push(engine, &mut engines);
    }

    if nvidia_present(sys) {
        if !push("gpu_nvidia", &mut engines) {
            warn!("nvidia driver present without gpu_nvidia engine, trying the generic one");
            if sys.exists("/sys/class/drm/card0") {
                push("gpu_others", &mut engines);
            }
        }
    } else if generic_gpu_present(sys) {
        push("gpu_others", &mut engines);
    } else {
        warn!("no supported GPU detected");
    }

    if gpu_temp_present(sys) {
        push("gpu_temp", &mut engines);
    }
    if sys.readable("/proc/net/dev") {
        push("net", &mut engines);
    }
    if sys.is_dir("/sys/class/bluetooth") {
        push("bt", &mut engines);
    }
    if psu_present(sys) {
        push("psu", &mut engines);
    }
    engines
}
