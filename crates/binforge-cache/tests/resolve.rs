//! End-to-end resolution through a stand-in compiler.
//!
//! The stand-in is a shell script that copies the source to the `-o` path and
//! appends one line to `calls.log` next to itself, so the tests can count
//! compiler invocations without a C++ toolchain.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use binforge_cache::hash::{sha256_file, sha256_hex};
use binforge_cache::manifest::{MANIFEST_FILE, Manifest};
use binforge_cache::sidecar::{InterfaceSidecar, sidecar_path};
use binforge_cache::{Loader, LoaderError, ResolveOptions, binary_file_name};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{ArtifactStatus, EventPayload, LoadPolicy};
use tempfile::TempDir;

const FAKE_COMPILER: &str = r#"#!/bin/sh
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *.cpp) src="$1"; shift ;;
    *) shift ;;
  esac
done
echo "$src" >> "$(dirname "$0")/calls.log"
cp "$src" "$out"
"#;

const BROKEN_COMPILER: &str = "#!/bin/sh\necho \"cpu.cpp:1: error: boom\" >&2\nexit 1\n";

struct Fixture {
    _root: TempDir,
    src: PathBuf,
    tools: PathBuf,
    cache: PathBuf,
    prebuilt: PathBuf,
    out: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_path_buf();
        let fixture = Self {
            src: base.join("src"),
            tools: base.join("tools"),
            cache: base.join(".binforge").join("cache"),
            prebuilt: base.join("assets").join("binaries"),
            out: base.join("engines"),
            _root: root,
        };
        std::fs::create_dir_all(&fixture.src).unwrap();
        std::fs::create_dir_all(&fixture.tools).unwrap();
        std::fs::write(fixture.src.join("cpu.cpp"), "// cpu engine v1\n").unwrap();
        fixture.script("cc.sh", FAKE_COMPILER);
        fixture.script("broken.sh", BROKEN_COMPILER);
        fixture
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.tools.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn options(&self, guarded: bool) -> ResolveOptions {
        let mut opts = ResolveOptions::new(&self.src, &self.cache, &self.prebuilt);
        opts.compiler = self.tools.join("cc.sh").display().to_string();
        if guarded {
            opts.output_dir = Some(self.out.clone());
        }
        opts
    }

    fn compiler_calls(&self) -> usize {
        std::fs::read_to_string(self.tools.join("calls.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn keyed_store(&self, loader: &Loader) -> PathBuf {
        self.prebuilt.join(loader.cache_key())
    }
}

fn cpu_bin() -> String {
    binary_file_name("cpu")
}

fn touch_later(path: &Path) {
    // Coarse filesystem timestamps: make sure the rewrite is strictly newer.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let mut content = std::fs::read(path).unwrap();
    content.extend_from_slice(b"// edited\n");
    std::fs::write(path, content).unwrap();
}

#[test]
fn build_only_writes_sidecar_backup_and_manifest() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let artifact = loader
        .resolve("cpu", LoadPolicy::BuildOnly, &fx.options(true))
        .unwrap();

    assert_eq!(artifact.status, ArtifactStatus::Rebuilt);
    assert_eq!(artifact.path, fx.out.join(cpu_bin()));
    assert!(sidecar_path(&artifact.path).is_file());

    let backup = fx.keyed_store(&loader).join(cpu_bin());
    assert!(backup.is_file());
    assert!(sidecar_path(&backup).is_file());
    let manifest = Manifest::load(&fx.keyed_store(&loader));
    assert_eq!(
        manifest.recorded_hash(&cpu_bin()),
        Some(sha256_file(&backup).unwrap().as_str())
    );
    assert_eq!(manifest.os_family.as_deref(), Some(std::env::consts::OS));
}

#[test]
fn sidecar_signature_hashes_the_exact_source() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let artifact = loader
        .resolve("cpu", LoadPolicy::BuildOnly, &fx.options(true))
        .unwrap();
    let sidecar = InterfaceSidecar::read(&artifact.path).unwrap();
    let signature = sidecar.build_signature.unwrap();
    assert_eq!(signature.source_hash, sha256_hex(b"// cpu engine v1\n"));
    assert_eq!(signature.language_standard, "c++17");
    assert_eq!(&sidecar.fingerprint, loader.fingerprint());
}

#[test]
fn prefer_prebuilt_restores_identical_bytes_after_cache_loss() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let opts = fx.options(true);
    let built = loader.resolve("cpu", LoadPolicy::BuildOnly, &opts).unwrap();
    let built_bytes = std::fs::read(&built.path).unwrap();

    std::fs::remove_dir_all(&fx.out).unwrap();

    let restored = loader.resolve("cpu", LoadPolicy::PreferPrebuilt, &opts).unwrap();
    assert_eq!(restored.status, ArtifactStatus::Restored);
    assert_eq!(std::fs::read(&restored.path).unwrap(), built_bytes);
    assert!(sidecar_path(&restored.path).is_file());
    assert_eq!(fx.compiler_calls(), 1);
}

#[test]
fn tampered_manifest_hash_is_not_restored() {
    let fx = Fixture::new();
    let bus = EventBus::default();
    let loader = Loader::new(bus.clone());
    let opts = fx.options(true);
    loader.resolve("cpu", LoadPolicy::BuildOnly, &opts).unwrap();
    std::fs::remove_dir_all(&fx.out).unwrap();

    let store = fx.keyed_store(&loader);
    let mut manifest = Manifest::load(&store);
    manifest.hashes.insert(cpu_bin(), "0".repeat(64));
    manifest.save(&store).unwrap();

    let mut scope = bus.scoped(&[Topic::Cache]);
    let artifact = loader.resolve("cpu", LoadPolicy::PreferPrebuilt, &opts).unwrap();
    assert_eq!(artifact.status, ArtifactStatus::Rebuilt);
    assert_eq!(fx.compiler_calls(), 2);

    let mismatch_reported = scope.drain().iter().any(|e| {
        matches!(&e.payload, EventPayload::Diagnostic { code, .. } if code == "cache:hash_mismatch")
    });
    assert!(mismatch_reported);
}

#[test]
fn prefer_cache_twice_builds_once() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    for guarded in [false, true] {
        let opts = fx.options(guarded);
        let before = fx.compiler_calls();
        let first = loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();
        let second = loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();
        assert_eq!(first.path, second.path);
        assert!(matches!(
            second.status,
            ArtifactStatus::UpToDate | ArtifactStatus::Restored
        ));
        assert!(fx.compiler_calls() <= before + 1);
    }
}

#[test]
fn unguarded_build_lands_in_key_scoped_cache() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let artifact = loader
        .resolve("cpu", LoadPolicy::BuildOnly, &fx.options(false))
        .unwrap();
    assert_eq!(artifact.path, fx.cache.join(loader.cache_key()).join(cpu_bin()));
    assert!(!sidecar_path(&artifact.path).exists());
    assert!(!fx.prebuilt.join(loader.cache_key()).join(MANIFEST_FILE).exists());
}

#[test]
fn edited_source_invalidates_fast_cache() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let opts = fx.options(false);
    loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();
    touch_later(&fx.src.join("cpu.cpp"));
    let again = loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();
    assert_eq!(again.status, ArtifactStatus::Rebuilt);
    assert_eq!(fx.compiler_calls(), 2);
}

#[test]
fn changed_flags_invalidate_guarded_target() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let mut opts = fx.options(true);
    opts.save_prebuilt = false;
    loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();

    opts.extra_compile_flags.push("-DTRACE".to_string());
    let again = loader.resolve("cpu", LoadPolicy::PreferCache, &opts).unwrap();
    assert_eq!(again.status, ArtifactStatus::Rebuilt);
}

#[test]
fn incompatible_store_is_skipped() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    std::fs::create_dir_all(&fx.prebuilt).unwrap();
    std::fs::write(fx.prebuilt.join(cpu_bin()), b"foreign").unwrap();
    let foreign = Manifest {
        os_family: Some("plan9".to_string()),
        ..Manifest::default()
    };
    foreign.save(&fx.prebuilt).unwrap();

    let artifact = loader
        .resolve("cpu", LoadPolicy::PreferPrebuilt, &fx.options(false))
        .unwrap();
    assert_eq!(artifact.status, ArtifactStatus::Rebuilt);
    assert_ne!(std::fs::read(&artifact.path).unwrap(), b"foreign");
}

#[test]
fn compiler_failure_carries_diagnostics_and_leaves_target_absent() {
    let fx = Fixture::new();
    let loader = Loader::new(EventBus::default());
    let mut opts = fx.options(true);
    opts.compiler = fx.tools.join("broken.sh").display().to_string();
    let err = loader.resolve("cpu", LoadPolicy::BuildOnly, &opts).unwrap_err();
    match err {
        LoaderError::BuildFailed { engine, diagnostics } => {
            assert_eq!(engine, "cpu");
            assert!(diagnostics.contains("boom"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.out.join(cpu_bin()).exists());
}

#[test]
fn artifact_ready_is_published() {
    let fx = Fixture::new();
    let bus = EventBus::default();
    let loader = Loader::new(bus.clone());
    let mut scope = bus.scoped(&[Topic::Cache]);
    loader
        .resolve("cpu", LoadPolicy::BuildOnly, &fx.options(false))
        .unwrap();
    let ready = scope.drain().into_iter().find_map(|e| match e.payload {
        EventPayload::ArtifactReady { engine, status, .. } => Some((engine, status)),
        _ => None,
    });
    assert_eq!(ready, Some(("cpu".to_string(), ArtifactStatus::Rebuilt)));
}
