//! The compile step.
//!
//! One compiler subprocess per engine. Output goes to a temporary sibling of
//! the live path and is renamed into place only when the compiler succeeds,
//! so an interrupted build never leaves a truncated binary behind.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{CacheError, LoaderError};

/// Everything one compiler invocation needs.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub engine: &'a str,
    pub source: &'a Path,
    pub output: &'a Path,
    pub compiler: &'a str,
    pub language_standard: &'a str,
    pub include_dirs: &'a [PathBuf],
    pub extra_compile_flags: &'a [String],
    pub extra_link_flags: &'a [String],
}

impl CompileRequest<'_> {
    /// Full argument vector, output path substituted by `tmp`.
    pub fn args(&self, tmp: &Path) -> Vec<String> {
        let mut args = vec![
            "-O3".to_string(),
            "-shared".to_string(),
            format!("-std={}", self.language_standard),
            "-fPIC".to_string(),
            "-fvisibility=hidden".to_string(),
        ];
        args.extend(
            self.include_dirs
                .iter()
                .map(|d| format!("-I{}", d.display())),
        );
        args.extend(self.extra_compile_flags.iter().cloned());
        args.push(self.source.display().to_string());
        args.push("-o".to_string());
        args.push(tmp.display().to_string());
        args.extend(self.extra_link_flags.iter().cloned());
        args
    }
}

fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    output.with_file_name(name)
}

/// Compile `req.source` into `req.output`.
pub fn compile(req: &CompileRequest<'_>) -> Result<(), LoaderError> {
    if let Some(missing) = req.include_dirs.iter().find(|d| !d.is_dir()) {
        return Err(LoaderError::ToolchainUnavailable {
            reason: format!("include directory {} not found", missing.display()),
        });
    }

    if let Some(parent) = req.output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }

    let tmp = temp_path(req.output);
    let args = req.args(&tmp);
    debug!(engine = req.engine, compiler = req.compiler, ?args, "invoking compiler");

    let output = match Command::new(req.compiler).args(&args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoaderError::ToolchainUnavailable {
                reason: format!("compiler '{}' not found", req.compiler),
            });
        }
        Err(e) => return Err(CacheError::io(req.compiler, e).into()),
    };

    if !output.status.success() {
        let _ = std::fs::remove_file(&tmp);
        let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            diagnostics.push_str(&stdout);
        }
        if diagnostics.trim().is_empty() {
            diagnostics = format!("compiler exited with {}", output.status);
        }
        return Err(LoaderError::BuildFailed {
            engine: req.engine.to_string(),
            diagnostics,
        });
    }

    if !tmp.is_file() {
        return Err(LoaderError::BuildFailed {
            engine: req.engine.to_string(),
            diagnostics: "compiler reported success but produced no output".to_string(),
        });
    }

    std::fs::rename(&tmp, req.output).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        CacheError::io(req.output, e)
    })?;
    info!(engine = req.engine, output = %req.output.display(), "compiled");
    Ok(())
}
