//! Script duties.
//!
//! Besides native engines a source directory may carry light duties written
//! as Python or JavaScript scripts. Each one runs as a child process under an
//! optional timeout; its exit code and output land in a [`ScriptOutcome`].
//! A batch never stops at a failing script.
//!
//! | Extension | Interpreter |
//! |---|---|
//! | `.py` | [`ScriptRunner::python`], else `python3` |
//! | `.js` | [`ScriptRunner::node`], else the first of `node`, `bun`, `deno` on `PATH` |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use binforge_middleware::{EventBus, Topic};
use binforge_types::Level;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::discovery::{discover_scripts, is_script};
use crate::error::BuilderError;
use crate::toolchain::{BoundedError, find_on_path, run_bounded};

const SOURCE: &str = "binforge-builder::duties";

const DEFAULT_PYTHON: &str = "python3";
const JS_RUNTIMES: &[&str] = &["node", "bun", "deno"];

/// Outcome of [`crate::Orchestrator::run_duties`]: the engine batch and
/// the script outcomes keyed by script path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DutiesReport {
    pub heavy: crate::orchestrator::BuildReport,
    pub scripts: BTreeMap<String, ScriptOutcome>,
}

impl DutiesReport {
    pub fn failed_scripts(&self) -> Vec<&str> {
        self.scripts
            .iter()
            .filter(|(_, outcome)| !outcome.ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// How script duties are started.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    pub python: Option<String>,
    pub node: Option<String>,
    /// Working directory of every script; the caller's when `None`.
    pub cwd: Option<PathBuf>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Result of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutcome {
    pub ok: bool,
    pub script: PathBuf,
    /// `None` when the script never started, timed out or was signalled.
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutcome {
    fn failed(script: &Path, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            script: script.to_path_buf(),
            returncode: None,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }
}

impl ScriptRunner {
    /// Interpreter and leading arguments for `script`.
    pub fn command_for(&self, script: &Path) -> Result<Command, BuilderError> {
        let ext = script
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let mut cmd = match ext.as_str() {
            "py" => Command::new(self.python.as_deref().unwrap_or(DEFAULT_PYTHON)),
            "js" => {
                let runtime = match &self.node {
                    Some(node) => PathBuf::from(node),
                    None => JS_RUNTIMES
                        .iter()
                        .find_map(|r| find_on_path(r))
                        .ok_or(BuilderError::NoScriptRuntime)?,
                };
                let is_deno = runtime.file_stem().is_some_and(|s| s == "deno");
                let mut cmd = Command::new(runtime);
                if is_deno {
                    cmd.args(["run", "--allow-read"]);
                }
                cmd
            }
            _ => return Err(BuilderError::UnsupportedScript(script.to_path_buf())),
        };
        cmd.arg(script);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    /// Run one script. A script that starts and fails is an `Ok` outcome
    /// with `ok == false`; only an unusable script path is an error.
    pub fn run(&self, script: &Path, args: &[String], bus: &EventBus) -> Result<ScriptOutcome, BuilderError> {
        if !script.is_file() {
            return Err(BuilderError::ScriptNotFound(script.to_path_buf()));
        }
        if !is_script(script) {
            return Err(BuilderError::UnsupportedScript(script.to_path_buf()));
        }
        let mut cmd = self.command_for(script)?;
        cmd.args(args);

        let name = script.display().to_string();
        info!(script = %name, "script duty started");
        bus.diagnostic(Topic::Build, SOURCE, Level::Info, "script:start", format!("running {name}"));

        let outcome = match run_bounded(&mut cmd, self.timeout) {
            Ok(output) => ScriptOutcome {
                ok: output.success(),
                script: script.to_path_buf(),
                returncode: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(BoundedError::TimedOut) => {
                error!(script = %name, timeout = ?self.timeout, "script duty timed out");
                bus.diagnostic(Topic::Build, SOURCE, Level::Error, "script:timeout", format!("{name} timed out"));
                return Ok(ScriptOutcome::failed(script, "timeout"));
            }
            Err(e) => {
                error!(script = %name, error = %e, "script duty could not run");
                bus.diagnostic(Topic::Build, SOURCE, Level::Error, "script:error", format!("{name}: {e}"));
                return Ok(ScriptOutcome::failed(script, e.to_string()));
            }
        };

        if outcome.ok {
            bus.diagnostic(Topic::Build, SOURCE, Level::Success, "script:done", format!("{name} done"));
        } else {
            warn!(script = %name, returncode = ?outcome.returncode, "script duty failed");
            bus.diagnostic(
                Topic::Build,
                SOURCE,
                Level::Warning,
                "script:fail",
                format!("{name} exited with {:?}", outcome.returncode),
            );
        }
        Ok(outcome)
    }

    /// Run the named scripts of `source_dir` (every discovered one when
    /// `names` is `None`), keyed by script path. Only a missing directory
    /// fails the call.
    pub fn run_all(
        &self,
        source_dir: &Path,
        names: Option<&[String]>,
        bus: &EventBus,
    ) -> Result<BTreeMap<String, ScriptOutcome>, BuilderError> {
        if !source_dir.is_dir() {
            return Err(BuilderError::SourceDirMissing(source_dir.to_path_buf()));
        }
        let scripts = match names {
            Some(names) => names.iter().map(|n| source_dir.join(n)).collect(),
            None => discover_scripts(source_dir)?,
        };
        if scripts.is_empty() {
            bus.diagnostic(Topic::Build, SOURCE, Level::Info, "script:empty", "no script duties found");
            return Ok(BTreeMap::new());
        }

        info!(count = scripts.len(), dir = %source_dir.display(), "script batch");
        let mut outcomes = BTreeMap::new();
        for script in scripts {
            let outcome = self
                .run(&script, &[], bus)
                .unwrap_or_else(|e| ScriptOutcome::failed(&script, e.to_string()));
            outcomes.insert(script.display().to_string(), outcome);
        }
        Ok(outcomes)
    }
}
