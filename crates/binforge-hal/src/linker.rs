//! [`Linker`] – load engines into the host and keep them callable.
//!
//! | Operation | Contract |
//! |---|---|
//! | [`Linker::link`] | `false` on any failure, never an error past this boundary |
//! | hotfix | one rebuild per engine per process, only for recoverable errors |
//! | [`Linker::call`] | typed read, links lazily when a binary exists |
//! | [`Linker::invoke`] | [`Linker::call`] with errors logged and mapped to `None` |

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use binforge_builder::Orchestrator;
use binforge_builder::orchestrator::ArtifactImporter;
use binforge_cache::sidecar::sidecar_path;
use binforge_cache::{LoadedArtifact, binary_file_name};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{EventPayload, Level, Reading};
use tracing::{debug, info, warn};

use crate::capability::LoadedModule;
use crate::error::{InvokeError, LinkError};
use crate::detect::{SysRoot, discover_required_engines};
use crate::registry::ModuleRegistry;

const SOURCE: &str = "binforge-hal::linker";

/// Turns a binary on disk into a [`LoadedModule`].
pub trait ModuleLoader: Send {
    fn load(&self, engine: &str, path: &Path) -> Result<LoadedModule, LinkError>;
}

/// Rebuilds one engine into the linker's engine directory.
pub trait HotfixBuilder: Send {
    fn rebuild(&mut self, engine: &str, engines_dir: &Path) -> Result<(), String>;
}

impl HotfixBuilder for Orchestrator {
    /// `compile_only` + `prefer_cache` for the one engine. The live binary
    /// just failed to load, so its sidecar no longer vouches for it.
    fn rebuild(&mut self, engine: &str, engines_dir: &Path) -> Result<(), String> {
        let live = engines_dir.join(binary_file_name(engine));
        if let Err(e) = std::fs::remove_file(sidecar_path(&live))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(engine, error = %e, "could not invalidate sidecar");
        }

        let report = self
            .fast_build_all(Some(engines_dir.to_path_buf()), Some(vec![engine.to_string()]))
            .map_err(|e| e.to_string())?;
        if let Some(message) = report.failed.get(engine).or(report.skipped.get(engine)) {
            return Err(message.clone());
        }
        report
            .artifact(engine)
            .map(|_| ())
            .ok_or_else(|| format!("batch produced no artifact for '{engine}'"))
    }
}

pub struct Linker {
    engines_dir: PathBuf,
    loader: Box<dyn ModuleLoader>,
    hotfix: Option<Box<dyn HotfixBuilder>>,
    registry: ModuleRegistry,
    /// Path each registered module was mapped from.
    linked_paths: HashMap<String, PathBuf>,
    link_errors: HashMap<String, LinkError>,
    hotfix_attempted: HashSet<String>,
    sys_root: SysRoot,
    bus: EventBus,
}

impl Linker {
    pub fn new(engines_dir: impl Into<PathBuf>, loader: impl ModuleLoader + 'static, bus: EventBus) -> Self {
        Self {
            engines_dir: engines_dir.into(),
            loader: Box::new(loader),
            hotfix: None,
            registry: ModuleRegistry::new(),
            linked_paths: HashMap::new(),
            link_errors: HashMap::new(),
            hotfix_attempted: HashSet::new(),
            sys_root: SysRoot::host(),
            bus,
        }
    }

    /// Enable self-repair through `builder`.
    pub fn with_hotfix(mut self, builder: impl HotfixBuilder + 'static) -> Self {
        self.hotfix = Some(Box::new(builder));
        self
    }

    /// Look under a different filesystem root in [`discover_required_engines`](Self::discover_required_engines).
    pub fn with_sys_root(mut self, sys_root: SysRoot) -> Self {
        self.sys_root = sys_root;
        self
    }

    pub fn engines_dir(&self) -> &Path {
        &self.engines_dir
    }

    pub fn binary_path(&self, engine: &str) -> PathBuf {
        self.engines_dir.join(binary_file_name(engine))
    }

    pub fn binary_exists(&self, engine: &str) -> bool {
        self.binary_path(engine).is_file()
    }

    pub fn discover_required_engines(&self) -> Vec<String> {
        discover_required_engines(&self.sys_root, |engine| self.binary_exists(engine))
    }

    pub fn is_linked(&self, engine: &str) -> bool {
        self.registry.contains(engine)
    }

    pub fn linked_engines(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Last link failure recorded for `engine`, cleared by a successful link.
    pub fn link_error(&self, engine: &str) -> Option<&LinkError> {
        self.link_errors.get(engine)
    }

    pub fn hotfix_attempted(&self, engine: &str) -> bool {
        self.hotfix_attempted.contains(engine)
    }

    /// Load (or reload) `engine` from the engine directory.
    pub fn link(&mut self, engine: &str) -> bool {
        let path = self.binary_path(engine);
        self.link_path(engine, &path).is_ok()
    }

    /// Load (or reload) `engine` from `path`, self-repairing once when the
    /// failure is recoverable.
    pub fn link_path(&mut self, engine: &str, path: &Path) -> Result<(), LinkError> {
        let err = match self.load_into_registry(engine, path) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        self.record_failure(engine, &err);

        if err.is_recoverable() && self.try_hotfix(engine) {
            let rebuilt = self.binary_path(engine);
            match self.load_into_registry(engine, &rebuilt) {
                Ok(()) => {
                    self.bus.emit(
                        Topic::Link,
                        SOURCE,
                        EventPayload::EngineHealed {
                            engine: engine.to_string(),
                            replacement: None,
                        },
                    );
                    return Ok(());
                }
                Err(retry) => {
                    self.record_failure(engine, &retry);
                    return Err(retry);
                }
            }
        }
        Err(err)
    }

    fn load_into_registry(&mut self, engine: &str, path: &Path) -> Result<(), LinkError> {
        if !path.is_file() {
            return Err(LinkError::BinaryNotFound(path.to_path_buf()));
        }
        // The dynamic loader caches images by path: reloading from the path
        // already mapped must release the old handle first, so a failed
        // reload there leaves the engine unlinked. From any other path the
        // new module is loaded first and the working one kept on failure.
        if self.linked_paths.get(engine).is_some_and(|mapped| mapped == path) {
            debug!(engine, "reloading in place");
            self.registry.unload(engine);
            self.linked_paths.remove(engine);
        }
        let module = self.loader.load(engine, path)?;
        self.registry.register(engine, module)?;
        self.linked_paths.insert(engine.to_string(), path.to_path_buf());
        self.link_errors.remove(engine);
        info!(engine, path = %path.display(), "engine linked");
        self.bus.diagnostic(
            Topic::Link,
            SOURCE,
            Level::Success,
            "linker:linked",
            format!("{engine} linked from {}", path.display()),
        );
        Ok(())
    }

    fn record_failure(&mut self, engine: &str, err: &LinkError) {
        warn!(engine, error = %err, recoverable = err.is_recoverable(), "link failed");
        self.bus.emit(
            Topic::Link,
            SOURCE,
            EventPayload::LinkFault {
                engine: engine.to_string(),
                error: err.to_string(),
                recoverable: err.is_recoverable(),
            },
        );
        self.link_errors.insert(engine.to_string(), err.clone());
    }

    /// At most one rebuild per engine for the lifetime of this linker.
    fn try_hotfix(&mut self, engine: &str) -> bool {
        let Some(builder) = self.hotfix.as_mut() else {
            return false;
        };
        if !self.hotfix_attempted.insert(engine.to_string()) {
            debug!(engine, "hotfix already attempted");
            return false;
        }

        info!(engine, "attempting hotfix rebuild");
        self.bus.diagnostic(
            Topic::Link,
            SOURCE,
            Level::Info,
            "linker:hotfix",
            format!("rebuilding {engine} after a recoverable link error"),
        );
        match builder.rebuild(engine, &self.engines_dir) {
            Ok(()) if self.engines_dir.join(binary_file_name(engine)).is_file() => true,
            Ok(()) => {
                warn!(engine, "hotfix finished without a binary");
                false
            }
            Err(message) => {
                warn!(engine, error = %message, "hotfix failed");
                self.bus.diagnostic(
                    Topic::Link,
                    SOURCE,
                    Level::Error,
                    "linker:hotfix_failed",
                    format!("{engine}: {message}"),
                );
                false
            }
        }
    }

    /// Read `engine`, linking it first if it is not loaded but has a binary.
    pub fn call(&mut self, engine: &str) -> Result<Reading, InvokeError> {
        if !self.registry.contains(engine) && self.binary_exists(engine) {
            self.link(engine);
        }
        let module = self
            .registry
            .get_mut(engine)
            .ok_or_else(|| InvokeError::NotLinked(engine.to_string()))?;
        module.read()
    }

    /// [`call`](Self::call) with failures logged and reported as `None`.
    pub fn invoke(&mut self, engine: &str) -> Option<Reading> {
        match self.call(engine) {
            Ok(reading) => Some(reading),
            Err(e) => {
                debug!(engine, error = %e, "invoke returned no data");
                None
            }
        }
    }
}

impl ArtifactImporter for Linker {
    fn import(&mut self, artifact: &LoadedArtifact) -> Result<(), String> {
        self.link_path(&artifact.engine, &artifact.path)
            .map_err(|e| e.to_string())
    }
}
