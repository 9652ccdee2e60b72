//! Build cache and loader.
//!
//! [`Loader::resolve`] turns an engine name into a binary at a target path,
//! trying sources in the order the [`LoadPolicy`] dictates. First success
//! wins:
//!
//! | Policy | Order |
//! |---|---|
//! | `prefer_prebuilt` | durable (key-scoped) → durable (plain) → fast cache → build |
//! | `prefer_cache` | fast cache → durable (key-scoped) → durable (plain) → build |
//! | `build_only` | build |
//! | `prebuilt_only` | durable (key-scoped) → durable (plain), else `NoCompatiblePrebuilt` |
//!
//! The target is `<output_dir>/<engine><ext>` when the caller names an output
//! directory and `<cache_root>/<cache_key>/<engine><ext>` otherwise. Interface
//! guarding (sidecar checks and writes, durable backups) is only active with
//! an explicit output directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use binforge_middleware::{EventBus, Topic};
use binforge_types::{ArtifactStatus, BuildSignature, EventPayload, Level, LoadPolicy, RuntimeFingerprint};
use tracing::{debug, info, warn};

use crate::compiler::{CompileRequest, compile};
use crate::error::{CacheError, LoaderError};
use crate::hash::sha256_file;
use crate::identity::{cache_key_for, fingerprint, manifest_compatible_with};
use crate::manifest::Manifest;
use crate::sidecar::{InterfaceSidecar, is_interface_compatible, sidecar_path};

const SOURCE: &str = "binforge-cache::loader";

/// Extension of engine sources inside the source directory.
pub const SOURCE_EXTENSION: &str = "cpp";

/// `cpu` → `cpu.so` (or `.dll` / `.dylib`).
pub fn binary_file_name(engine: &str) -> String {
    format!("{engine}{}", std::env::consts::DLL_SUFFIX)
}

/// Caller-supplied inputs of one resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub source_dir: PathBuf,
    /// Fast cache root; entries live under `<cache_root>/<cache_key>/`.
    pub cache_root: PathBuf,
    /// Durable store root; key-scoped under `<prebuilt_root>/<cache_key>/`,
    /// plain directly under the root.
    pub prebuilt_root: PathBuf,
    /// Explicit target directory. Turns interface guarding on.
    pub output_dir: Option<PathBuf>,
    pub compiler: String,
    pub language_standard: String,
    pub include_dirs: Vec<PathBuf>,
    pub extra_compile_flags: Vec<String>,
    pub extra_link_flags: Vec<String>,
    /// Back freshly built binaries up into the durable store.
    pub save_prebuilt: bool,
}

impl ResolveOptions {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        cache_root: impl Into<PathBuf>,
        prebuilt_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_root: cache_root.into(),
            prebuilt_root: prebuilt_root.into(),
            output_dir: None,
            compiler: "g++".to_string(),
            language_standard: "c++17".to_string(),
            include_dirs: Vec::new(),
            extra_compile_flags: Vec::new(),
            extra_link_flags: Vec::new(),
            save_prebuilt: true,
        }
    }

    pub fn interface_guarded(&self) -> bool {
        self.output_dir.is_some()
    }

    pub fn source_path(&self, engine: &str) -> PathBuf {
        self.source_dir.join(format!("{engine}.{SOURCE_EXTENSION}"))
    }
}

/// Where a resolved binary ended up and how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedArtifact {
    pub engine: String,
    pub path: PathBuf,
    pub status: ArtifactStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    FastCache,
    PrebuiltKeyed,
    PrebuiltPlain,
}

fn steps_for(policy: LoadPolicy) -> &'static [Step] {
    match policy {
        LoadPolicy::PreferPrebuilt => &[Step::PrebuiltKeyed, Step::PrebuiltPlain, Step::FastCache],
        LoadPolicy::PreferCache => &[Step::FastCache, Step::PrebuiltKeyed, Step::PrebuiltPlain],
        LoadPolicy::BuildOnly => &[],
        LoadPolicy::PrebuiltOnly => &[Step::PrebuiltKeyed, Step::PrebuiltPlain],
    }
}

/// Per-call state shared by the resolution steps.
struct Job<'a> {
    engine: &'a str,
    opts: &'a ResolveOptions,
    source: PathBuf,
    target: PathBuf,
    signature: Option<BuildSignature>,
}

/// Resolves engines against one fingerprint and reports over one bus.
#[derive(Debug, Clone)]
pub struct Loader {
    bus: EventBus,
    fingerprint: RuntimeFingerprint,
    cache_key: String,
}

impl Loader {
    /// Loader for the running process.
    pub fn new(bus: EventBus) -> Self {
        Self::with_fingerprint(bus, fingerprint().clone())
    }

    pub fn with_fingerprint(bus: EventBus, fingerprint: RuntimeFingerprint) -> Self {
        let cache_key = cache_key_for(&fingerprint);
        Self {
            bus,
            fingerprint,
            cache_key,
        }
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn fingerprint(&self) -> &RuntimeFingerprint {
        &self.fingerprint
    }

    /// Directory the binary for this loader's key lands in when no output
    /// directory is given.
    pub fn default_target_dir(&self, opts: &ResolveOptions) -> PathBuf {
        opts.cache_root.join(&self.cache_key)
    }

    /// Signature of a build of `engine` under `opts`.
    pub fn build_signature(
        &self,
        engine: &str,
        opts: &ResolveOptions,
    ) -> Result<BuildSignature, LoaderError> {
        let source = opts.source_path(engine);
        Ok(BuildSignature {
            source_hash: sha256_file(&source)?,
            compiler_id: opts.compiler.clone(),
            language_standard: opts.language_standard.clone(),
            extra_compile_flags: opts.extra_compile_flags.clone(),
            extra_link_flags: opts.extra_link_flags.clone(),
        })
    }

    /// Resolve `engine` to a binary under `policy`.
    pub fn resolve(
        &self,
        engine: &str,
        policy: LoadPolicy,
        opts: &ResolveOptions,
    ) -> Result<LoadedArtifact, LoaderError> {
        let source = opts.source_path(engine);
        if !source.is_file() {
            return Err(LoaderError::SourceNotFound {
                engine: engine.to_string(),
                path: source,
            });
        }

        let target_dir = match &opts.output_dir {
            Some(dir) => dir.clone(),
            None => self.default_target_dir(opts),
        };
        let signature = if opts.interface_guarded() {
            Some(self.build_signature(engine, opts)?)
        } else {
            None
        };
        let job = Job {
            engine,
            opts,
            source,
            target: target_dir.join(binary_file_name(engine)),
            signature,
        };
        debug!(engine, %policy, target = %job.target.display(), "resolving");

        for step in steps_for(policy) {
            let status = match step {
                Step::FastCache => self.try_fast_cache(&job).then_some(ArtifactStatus::UpToDate),
                Step::PrebuiltKeyed => {
                    let dir = opts.prebuilt_root.join(&self.cache_key);
                    self.try_prebuilt(&job, &dir).then_some(ArtifactStatus::Restored)
                }
                Step::PrebuiltPlain => self
                    .try_prebuilt(&job, &opts.prebuilt_root)
                    .then_some(ArtifactStatus::Restored),
            };
            if let Some(status) = status {
                if status == ArtifactStatus::UpToDate && opts.interface_guarded() && opts.save_prebuilt {
                    self.backup(&job);
                }
                return Ok(self.finish(&job, status));
            }
        }

        if policy == LoadPolicy::PrebuiltOnly {
            self.bus.diagnostic(
                Topic::Cache,
                SOURCE,
                Level::Error,
                "cache:no_prebuilt",
                format!("{engine}: no compatible prebuilt binary"),
            );
            return Err(LoaderError::NoCompatiblePrebuilt {
                engine: engine.to_string(),
            });
        }

        self.build(&job)?;
        Ok(self.finish(&job, ArtifactStatus::Rebuilt))
    }

    // ── fast cache ──────────────────────────────────────────────────────────

    fn try_fast_cache(&self, job: &Job<'_>) -> bool {
        if !job.target.is_file() {
            return false;
        }
        if !newer_or_equal(&job.target, &job.source) {
            self.skip(job, "cache:stale", "cached binary is older than its source");
            return false;
        }
        if job.opts.interface_guarded()
            && !is_interface_compatible(&job.target, &self.fingerprint, job.signature.as_ref())
        {
            self.skip(job, "cache:interface", "cached binary has a mismatching interface sidecar");
            return false;
        }
        true
    }

    // ── durable store ───────────────────────────────────────────────────────

    fn try_prebuilt(&self, job: &Job<'_>, store_dir: &Path) -> bool {
        match self.restore_from(job, store_dir) {
            Ok(restored) => restored,
            Err(e) => {
                warn!(engine = job.engine, store = %store_dir.display(), error = %e, "restore failed");
                self.skip(job, "cache:restore_failed", &e.to_string());
                false
            }
        }
    }

    fn restore_from(&self, job: &Job<'_>, store_dir: &Path) -> Result<bool, CacheError> {
        let file_name = binary_file_name(job.engine);
        let candidate = store_dir.join(&file_name);
        if !candidate.is_file() {
            return Ok(false);
        }
        if same_file(&candidate, &job.target) {
            return Ok(false);
        }

        let manifest = Manifest::load(store_dir);
        if !manifest_compatible_with(&manifest, &self.fingerprint) {
            self.skip(job, "cache:incompatible", &format!("{} was built for another runtime", store_dir.display()));
            return Ok(false);
        }
        if !newer_or_equal(&candidate, &job.source) {
            self.skip(job, "cache:stale", &format!("{} is older than its source", candidate.display()));
            return Ok(false);
        }
        if let Some(expected) = manifest.recorded_hash(&file_name) {
            let actual = sha256_file(&candidate)?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(engine = job.engine, candidate = %candidate.display(), expected, actual = %actual, "hash mismatch");
                self.skip(job, "cache:hash_mismatch", &format!("{} does not match its manifest hash", candidate.display()));
                return Ok(false);
            }
        }

        install(&candidate, &job.target)?;
        let candidate_sidecar = sidecar_path(&candidate);
        if candidate_sidecar.is_file() {
            install(&candidate_sidecar, &sidecar_path(&job.target))?;
        }
        if job.opts.interface_guarded() {
            InterfaceSidecar::new(&self.fingerprint, job.signature.as_ref()).write(&job.target)?;
        }
        info!(engine = job.engine, from = %candidate.display(), "restored");
        Ok(true)
    }

    // ── build ───────────────────────────────────────────────────────────────

    fn build(&self, job: &Job<'_>) -> Result<(), LoaderError> {
        self.bus.diagnostic(
            Topic::Build,
            SOURCE,
            Level::Info,
            "builder:compile",
            format!("compiling {}", job.engine),
        );
        let req = CompileRequest {
            engine: job.engine,
            source: &job.source,
            output: &job.target,
            compiler: &job.opts.compiler,
            language_standard: &job.opts.language_standard,
            include_dirs: &job.opts.include_dirs,
            extra_compile_flags: &job.opts.extra_compile_flags,
            extra_link_flags: &job.opts.extra_link_flags,
        };
        if let Err(e) = compile(&req) {
            self.bus.diagnostic(Topic::Build, SOURCE, Level::Error, "builder:failed", e.to_string());
            return Err(e);
        }

        if job.opts.interface_guarded() {
            InterfaceSidecar::new(&self.fingerprint, job.signature.as_ref()).write(&job.target)?;
            if job.opts.save_prebuilt {
                self.backup(job);
            }
        }
        Ok(())
    }

    /// Copy the target (and its sidecar) into the key-scoped durable store
    /// and record its hash there. Failures are logged, never fatal.
    fn backup(&self, job: &Job<'_>) {
        let dest_dir = job.opts.prebuilt_root.join(&self.cache_key);
        let dest = dest_dir.join(binary_file_name(job.engine));
        if same_file(&dest, &job.target) {
            return;
        }
        let result = (|| -> Result<(), CacheError> {
            install(&job.target, &dest)?;
            let sidecar = sidecar_path(&job.target);
            if sidecar.is_file() {
                install(&sidecar, &sidecar_path(&dest))?;
            }
            Manifest::upsert(&dest, &self.fingerprint)?;
            Ok(())
        })();
        match result {
            Ok(()) => debug!(engine = job.engine, dest = %dest.display(), "backed up"),
            Err(e) => {
                warn!(engine = job.engine, error = %e, "durable backup failed");
                self.bus.diagnostic(Topic::Cache, SOURCE, Level::Warning, "cache:backup_failed", e.to_string());
            }
        }
    }

    fn finish(&self, job: &Job<'_>, status: ArtifactStatus) -> LoadedArtifact {
        info!(engine = job.engine, %status, path = %job.target.display(), "artifact ready");
        self.bus.emit(
            Topic::Cache,
            SOURCE,
            EventPayload::ArtifactReady {
                engine: job.engine.to_string(),
                path: job.target.display().to_string(),
                status,
            },
        );
        LoadedArtifact {
            engine: job.engine.to_string(),
            path: job.target.clone(),
            status,
        }
    }

    fn skip(&self, job: &Job<'_>, code: &str, reason: &str) {
        debug!(engine = job.engine, code, reason, "skipping candidate");
        self.bus.diagnostic(
            Topic::Cache,
            SOURCE,
            Level::Warning,
            code,
            format!("{}: {reason}", job.engine),
        );
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn newer_or_equal(binary: &Path, source: &Path) -> bool {
    match (modified(binary), modified(source)) {
        (Some(b), Some(s)) => b >= s,
        _ => false,
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copy `from` to `to` through a temporary sibling and an atomic rename.
fn install(from: &Path, to: &Path) -> Result<(), CacheError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let mut tmp_name = to.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp = to.with_file_name(tmp_name);
    std::fs::copy(from, &tmp).map_err(|e| CacheError::io(from, e))?;
    std::fs::rename(&tmp, to).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        CacheError::io(to, e)
    })
}
