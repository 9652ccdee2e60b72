//! Batch builds.
//!
//! [`Orchestrator::build_all`] resolves every requested engine on its own and
//! never aborts the batch for a single engine: failures are collected into
//! the [`BuildReport`], which makes partial success a normal outcome. Only a
//! missing source directory fails the whole call.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use binforge_cache::{LoadedArtifact, Loader, ResolveOptions};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{ArtifactStatus, Level, LoadPolicy};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::discovery::discover_units;
use crate::duties::{DutiesReport, ScriptRunner};
use crate::error::BuilderError;
use crate::layout::ProjectLayout;
use crate::toolchain::{ToolchainReport, snapshot_toolchain};

const SOURCE: &str = "binforge-builder::orchestrator";

/// Engines whose build failure is reported as skipped rather than failed.
pub const DEFAULT_OPTIONAL_ENGINES: &[&str] = &["gpu_nvidia"];

/// Receives each resolved artifact of a non-compile-only batch so it can be
/// loaded into the host right away.
pub trait ArtifactImporter {
    fn import(&mut self, artifact: &LoadedArtifact) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Explicit engine names; `None` means every discovered unit.
    pub engines: Option<Vec<String>>,
    pub policy: LoadPolicy,
    pub compile_only: bool,
    pub output_dir: Option<PathBuf>,
    pub compiler: Option<String>,
    pub extra_compile_flags: Vec<String>,
    pub extra_link_flags: Vec<String>,
    pub save_prebuilt: bool,
    /// `engines.json` location; defaults to the one in the source directory.
    pub config_path: Option<PathBuf>,
    pub snapshot_toolchain: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            engines: None,
            policy: LoadPolicy::default(),
            compile_only: false,
            output_dir: None,
            compiler: None,
            extra_compile_flags: Vec::new(),
            extra_link_flags: Vec::new(),
            save_prebuilt: true,
            config_path: None,
            snapshot_toolchain: true,
        }
    }
}

impl BuildRequest {
    /// `compile_only`, `prefer_cache`, durable backup on.
    pub fn fast(output_dir: Option<PathBuf>) -> Self {
        Self {
            policy: LoadPolicy::PreferCache,
            compile_only: true,
            output_dir,
            save_prebuilt: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub engine: String,
    pub path: PathBuf,
    pub status: ArtifactStatus,
}

impl From<&LoadedArtifact> for ArtifactRecord {
    fn from(artifact: &LoadedArtifact) -> Self {
        Self {
            engine: artifact.engine.clone(),
            path: artifact.path.clone(),
            status: artifact.status,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub artifacts: Vec<ArtifactRecord>,
    pub failed: BTreeMap<String, String>,
    pub skipped: BTreeMap<String, String>,
    pub toolchain_changed: bool,
}

impl BuildReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn artifact(&self, engine: &str) -> Option<&ArtifactRecord> {
        self.artifacts.iter().find(|a| a.engine == engine)
    }
}

/// Drives [`Loader`] over a project.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    layout: ProjectLayout,
    bus: EventBus,
    loader: Loader,
    compiler: String,
    language_standard: String,
    optional_engines: BTreeSet<String>,
}

impl Orchestrator {
    pub fn new(layout: ProjectLayout, bus: EventBus) -> Self {
        let loader = Loader::new(bus.clone());
        Self {
            layout,
            bus,
            loader,
            compiler: "g++".to_string(),
            language_standard: "c++17".to_string(),
            optional_engines: DEFAULT_OPTIONAL_ENGINES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_language_standard(mut self, standard: impl Into<String>) -> Self {
        self.language_standard = standard.into();
        self
    }

    pub fn with_optional_engines<I, S>(mut self, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_engines = engines.into_iter().map(Into::into).collect();
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    /// Call-level resolve options before per-engine overrides.
    pub fn base_options(&self, req: &BuildRequest) -> ResolveOptions {
        let mut opts = ResolveOptions::new(
            &self.layout.source_dir,
            &self.layout.cache_root,
            &self.layout.prebuilt_root,
        );
        opts.output_dir = req.output_dir.clone();
        opts.compiler = req.compiler.clone().unwrap_or_else(|| self.compiler.clone());
        opts.language_standard = self.language_standard.clone();
        opts.include_dirs = self.layout.include_dirs();
        opts.extra_compile_flags = req.extra_compile_flags.clone();
        opts.extra_link_flags = req.extra_link_flags.clone();
        opts.save_prebuilt = req.save_prebuilt;
        opts
    }

    pub fn snapshot_toolchain(&self, compiler: Option<&str>) -> Result<ToolchainReport, BuilderError> {
        snapshot_toolchain(
            &self.layout.toolchain_dir,
            compiler.unwrap_or(&self.compiler),
            &self.bus,
        )
    }

    /// Resolve every requested engine; see the module docs for failure
    /// semantics.
    pub fn build_all(
        &self,
        req: &BuildRequest,
        mut importer: Option<&mut dyn ArtifactImporter>,
    ) -> Result<BuildReport, BuilderError> {
        let source_dir = &self.layout.source_dir;
        if !source_dir.is_dir() {
            return Err(BuilderError::SourceDirMissing(source_dir.clone()));
        }

        let mut report = BuildReport::default();
        if req.snapshot_toolchain {
            match self.snapshot_toolchain(req.compiler.as_deref()) {
                Ok(snapshot) => report.toolchain_changed = snapshot.changed,
                Err(e) => warn!(error = %e, "toolchain snapshot failed"),
            }
        }

        let engines = match &req.engines {
            Some(names) => names.clone(),
            None => discover_units(source_dir)?,
        };
        let config_path = req
            .config_path
            .clone()
            .unwrap_or_else(|| EngineConfig::default_path(source_dir));
        let config = EngineConfig::load(&config_path);
        let base = self.base_options(req);

        info!(count = engines.len(), policy = %req.policy, compile_only = req.compile_only, "build batch");
        for engine in &engines {
            let (opts, policy) = config.apply(engine, &base, req.policy);
            let outcome = self
                .loader
                .resolve(engine, policy, &opts)
                .map_err(|e| e.to_string())
                .and_then(|artifact| {
                    if !req.compile_only
                        && let Some(importer) = importer.as_deref_mut()
                    {
                        importer.import(&artifact)?;
                    }
                    Ok(artifact)
                });

            match outcome {
                Ok(artifact) => report.artifacts.push(ArtifactRecord::from(&artifact)),
                Err(message) if self.optional_engines.contains(engine) => {
                    warn!(engine = %engine, error = %message, "optional engine skipped");
                    report.skipped.insert(engine.clone(), message);
                }
                Err(message) => {
                    error!(engine = %engine, error = %message, "engine failed");
                    report.failed.insert(engine.clone(), message);
                }
            }
        }

        self.announce(&report);
        Ok(report)
    }

    /// `build_all` with `compile_only`, `prefer_cache` and durable backups.
    pub fn fast_build_all(
        &self,
        output_dir: Option<PathBuf>,
        engines: Option<Vec<String>>,
    ) -> Result<BuildReport, BuilderError> {
        let req = BuildRequest {
            engines,
            ..BuildRequest::fast(output_dir)
        };
        self.build_all(&req, None)
    }

    /// Engines of the project, then the script duties of `script_dir`.
    ///
    /// Script failures are recorded in the report; a missing script
    /// directory fails the call like a missing source directory does.
    pub fn run_duties(
        &self,
        req: &BuildRequest,
        importer: Option<&mut dyn ArtifactImporter>,
        script_dir: Option<&Path>,
        script_names: Option<&[String]>,
        runner: &ScriptRunner,
    ) -> Result<DutiesReport, BuilderError> {
        self.bus.diagnostic(
            Topic::Build,
            SOURCE,
            Level::Info,
            "duties:start",
            "building engines, then running script duties",
        );
        let heavy = self.build_all(req, importer)?;
        let scripts = match script_dir {
            Some(dir) => runner.run_all(dir, script_names, &self.bus)?,
            None => BTreeMap::new(),
        };
        let report = DutiesReport { heavy, scripts };
        let failed = report.failed_scripts();
        info!(
            engines = report.heavy.artifacts.len(),
            scripts = report.scripts.len(),
            failed_scripts = failed.len(),
            "duties finished"
        );
        self.bus.diagnostic(
            Topic::Build,
            SOURCE,
            if failed.is_empty() { Level::Success } else { Level::Warning },
            "duties:done",
            format!(
                "{} engine(s), {} script(s), {} script failure(s)",
                report.heavy.artifacts.len(),
                report.scripts.len(),
                failed.len()
            ),
        );
        Ok(report)
    }

    fn announce(&self, report: &BuildReport) {
        if report.is_partial() {
            let names: Vec<&str> = report.failed.keys().map(String::as_str).collect();
            self.bus.diagnostic(
                Topic::Build,
                SOURCE,
                Level::Warning,
                "builder:partial",
                format!(
                    "{} engine(s) failed: {}",
                    report.failed.len(),
                    names.join(", ")
                ),
            );
        } else {
            self.bus.diagnostic(
                Topic::Build,
                SOURCE,
                Level::Success,
                "builder:done",
                format!("{} engine(s) ready", report.artifacts.len()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_request_shape() {
        let req = BuildRequest::fast(Some(PathBuf::from("/out")));
        assert!(req.compile_only);
        assert!(req.save_prebuilt);
        assert_eq!(req.policy, LoadPolicy::PreferCache);
    }

    #[test]
    fn partial_means_failures() {
        let mut report = BuildReport::default();
        assert!(!report.is_partial());
        report.skipped.insert("gpu_nvidia".to_string(), "no nvcc".to_string());
        assert!(!report.is_partial());
        report.failed.insert("cpu".to_string(), "boom".to_string());
        assert!(report.is_partial());
    }

    #[test]
    fn missing_source_dir_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::discover(&dir.path().join("missing"));
        let orchestrator = Orchestrator::new(layout, EventBus::default());
        let req = BuildRequest {
            snapshot_toolchain: false,
            ..BuildRequest::default()
        };
        let err = orchestrator.build_all(&req, None).unwrap_err();
        assert!(matches!(err, BuilderError::SourceDirMissing(_)));
    }

    #[test]
    fn base_options_follow_request() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(ProjectLayout::discover(dir.path()), EventBus::default())
            .with_compiler("clang++");
        let req = BuildRequest {
            output_dir: Some(PathBuf::from("/out")),
            ..BuildRequest::default()
        };
        let opts = orchestrator.base_options(&req);
        assert_eq!(opts.compiler, "clang++");
        assert!(opts.interface_guarded());
        let req = BuildRequest {
            compiler: Some("g++-13".to_string()),
            ..BuildRequest::default()
        };
        assert_eq!(orchestrator.base_options(&req).compiler, "g++-13");
    }
}
