//! Toolchain snapshot.
//!
//! Short `--version` queries of the compiler, the host runtime and the C
//! runtime, compared against the snapshot persisted for the current cache
//! key. The snapshot is rewritten on every call; `changed` only reports
//! drift, it never invalidates cache entries by itself.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use binforge_cache::{cache_key_for, fingerprint};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{Level, RuntimeFingerprint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BuilderError;

pub const VERSION_TIMEOUT: Duration = Duration::from_secs(3);
const SOURCE: &str = "binforge-builder::toolchain";

/// Command queried as the auxiliary runtime: the C runtime's loader reports
/// the libc version that native engines link against.
pub const AUXILIARY_RUNTIME: &str = "ldd";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub system: String,
    pub release: String,
    pub machine: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSnapshot {
    pub runtime: RuntimeFingerprint,
    pub platform: PlatformInfo,
    pub compiler: ToolInfo,
    pub managed_runtime: ToolInfo,
    pub auxiliary_runtime: ToolInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolchainReport {
    pub snapshot: ToolchainSnapshot,
    pub changed: bool,
    pub path: PathBuf,
}

pub fn platform_info() -> PlatformInfo {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    PlatformInfo {
        system: std::env::consts::OS.to_string(),
        release,
        machine: std::env::consts::ARCH.to_string(),
    }
}

/// Resolve `cmd` against `PATH`, like `which`.
pub fn find_on_path(cmd: &str) -> Option<PathBuf> {
    let candidate = Path::new(cmd);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(cmd))
        .find(|full| full.is_file())
}

/// Path and first output line of `cmd --version`, bounded by `timeout`.
///
/// A missing command, a hang or a crash yields an empty version, never an
/// error.
pub fn query_version(cmd: &str, timeout: Duration) -> ToolInfo {
    let path = find_on_path(cmd)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| cmd.to_string());
    let version = first_line(&path, &["--version"], timeout).unwrap_or_default();
    ToolInfo { path, version }
}

/// Exit code and captured output of a child run by [`run_bounded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    /// `None` when the child was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoundedError {
    #[error("cannot start: {0}")]
    Spawn(std::io::Error),
    #[error("timeout")]
    TimedOut,
}

/// Run `cmd` to completion, killing it once `timeout` has passed.
///
/// Both pipes are drained on helper threads while the child runs, so a
/// chatty child cannot stall on a full pipe. On timeout the readers are
/// left to finish on their own: a grandchild may still hold the pipes.
pub fn run_bounded(cmd: &mut Command, timeout: Option<Duration>) -> Result<BoundedOutput, BoundedError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(BoundedError::Spawn)?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if deadline.is_none_or(|d| Instant::now() < d) => {
                std::thread::sleep(Duration::from_millis(20))
            }
            _ => {
                debug!(program = ?cmd.get_program(), "child timed out");
                let _ = child.kill();
                let _ = child.wait();
                return Err(BoundedError::TimedOut);
            }
        }
    };

    let collect = |reader: Option<JoinHandle<Vec<u8>>>| {
        reader
            .and_then(|r| r.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };
    Ok(BoundedOutput {
        code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// First non-empty line of a short command, stdout first, then stderr.
fn first_line(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let output = run_bounded(Command::new(program).args(args), Some(timeout)).ok()?;
    [output.stdout, output.stderr].into_iter().find_map(|text| {
        text.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    })
}

/// Take a fresh snapshot without touching disk.
pub fn take_snapshot(compiler: &str) -> ToolchainSnapshot {
    let managed_runtime = ToolInfo {
        path: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    ToolchainSnapshot {
        runtime: fingerprint().clone(),
        platform: platform_info(),
        compiler: query_version(compiler, VERSION_TIMEOUT),
        managed_runtime,
        auxiliary_runtime: query_version(AUXILIARY_RUNTIME, VERSION_TIMEOUT),
    }
}

/// `<toolchain_dir>/<cache_key>.json`
pub fn snapshot_path(toolchain_dir: &Path, runtime: &RuntimeFingerprint) -> PathBuf {
    toolchain_dir.join(format!("{}.json", cache_key_for(runtime)))
}

/// Compare `snapshot` with the persisted one and persist it.
pub fn record_snapshot(
    toolchain_dir: &Path,
    snapshot: ToolchainSnapshot,
) -> Result<ToolchainReport, BuilderError> {
    let path = snapshot_path(toolchain_dir, &snapshot.runtime);
    let previous = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ToolchainSnapshot>(&raw).ok());
    let changed = previous.as_ref() != Some(&snapshot);

    std::fs::create_dir_all(toolchain_dir).map_err(|e| BuilderError::io(toolchain_dir, e))?;
    let json = serde_json::to_string_pretty(&snapshot).map_err(|e| BuilderError::Serialization {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    std::fs::write(&path, json).map_err(|e| BuilderError::io(&path, e))?;

    Ok(ToolchainReport {
        snapshot,
        changed,
        path,
    })
}

/// Query versions, compare and persist; announce drift on the bus.
pub fn snapshot_toolchain(
    toolchain_dir: &Path,
    compiler: &str,
    bus: &EventBus,
) -> Result<ToolchainReport, BuilderError> {
    let report = record_snapshot(toolchain_dir, take_snapshot(compiler))?;
    info!(
        changed = report.changed,
        compiler = %report.snapshot.compiler.version,
        path = %report.path.display(),
        "toolchain snapshot"
    );
    let (level, message) = if report.changed {
        (Level::Warning, "toolchain changed since the last snapshot")
    } else {
        (Level::Info, "toolchain unchanged")
    };
    bus.diagnostic(Topic::Build, SOURCE, level, "toolchain:snapshot", message);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(compiler_version: &str) -> ToolchainSnapshot {
        ToolchainSnapshot {
            runtime: fingerprint().clone(),
            platform: platform_info(),
            compiler: ToolInfo {
                path: "/usr/bin/g++".to_string(),
                version: compiler_version.to_string(),
            },
            managed_runtime: ToolInfo::default(),
            auxiliary_runtime: ToolInfo::default(),
        }
    }

    #[test]
    fn first_snapshot_is_a_change_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = record_snapshot(dir.path(), snapshot("g++ 13.2")).unwrap();
        assert!(first.changed);
        assert!(first.path.is_file());
        let second = record_snapshot(dir.path(), snapshot("g++ 13.2")).unwrap();
        assert!(!second.changed);
        let third = record_snapshot(dir.path(), snapshot("g++ 14.1")).unwrap();
        assert!(third.changed);
    }

    #[test]
    fn corrupt_previous_snapshot_counts_as_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), fingerprint());
        std::fs::write(&path, "garbage").unwrap();
        let report = record_snapshot(dir.path(), snapshot("g++ 13.2")).unwrap();
        assert!(report.changed);
        let persisted: ToolchainSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted, snapshot("g++ 13.2"));
    }

    #[test]
    fn missing_tool_reports_empty_version() {
        let info = query_version("binforge-no-such-tool", Duration::from_millis(200));
        assert_eq!(info.path, "binforge-no-such-tool");
        assert!(info.version.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn hanging_version_query_is_killed() {
        let started = Instant::now();
        let result = run_bounded(
            Command::new("sleep").arg("5"),
            Some(Duration::from_millis(200)),
        );
        assert!(matches!(result, Err(BoundedError::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn version_is_first_non_empty_line() {
        assert_eq!(
            first_line("sh", &["-c", "echo; echo 'tool 1.2'; echo extra"], VERSION_TIMEOUT).as_deref(),
            Some("tool 1.2")
        );
    }

    #[cfg(unix)]
    #[test]
    fn chatty_child_is_not_mistaken_for_a_hang() {
        // Far more than a pipe buffer on both streams.
        let script = "head -c 1000000 /dev/zero | tr '\\0' a; head -c 1000000 /dev/zero | tr '\\0' b >&2";
        let output = run_bounded(
            Command::new("sh").args(["-c", script]),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.len(), 1_000_000);
        assert_eq!(output.stderr.len(), 1_000_000);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let result = run_bounded(&mut Command::new("binforge-no-such-tool"), None);
        assert!(matches!(result, Err(BoundedError::Spawn(_))));
    }
}
