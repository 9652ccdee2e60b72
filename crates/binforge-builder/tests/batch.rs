//! Batch builds, cleanup and pruning against a throwaway project tree.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use binforge_builder::prune::prune_at;
use binforge_builder::{
    ArtifactImporter, BuildRequest, CleanMode, CleanOptions, CleanProfile, Orchestrator,
    ProjectLayout, ScriptRunner, clean,
};
use binforge_cache::{LoadedArtifact, binary_file_name};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{ArtifactStatus, EventPayload, LoadPolicy};
use tempfile::TempDir;

/// Copies the source to `-o`, but fails like a real compiler when the
/// source contains `#error`.
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
if grep -q '#error' "$src"; then
  echo "$src:1:2: error: #error directive" >&2
  exit 1
fi
cp "$src" "$out"
"#;

struct Project {
    _dir: TempDir,
    root: PathBuf,
    src: PathBuf,
    compiler: String,
}

impl Project {
    fn new(engines: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap().join("proj");
        let src = root.join("native");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(root.join("assets")).unwrap();
        for (name, body) in engines {
            std::fs::write(src.join(format!("{name}.cpp")), body).unwrap();
        }
        let compiler = root.join("cc.sh");
        std::fs::write(&compiler, FAKE_COMPILER).unwrap();
        std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            _dir: dir,
            compiler: compiler.display().to_string(),
            root,
            src,
        }
    }

    fn layout(&self) -> ProjectLayout {
        ProjectLayout::discover(&self.src)
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.layout(), EventBus::default()).with_compiler(&self.compiler)
    }
}

fn request(policy: LoadPolicy) -> BuildRequest {
    BuildRequest {
        policy,
        snapshot_toolchain: false,
        ..BuildRequest::default()
    }
}

#[derive(Default)]
struct Recorder {
    imported: Vec<String>,
    reject: Option<String>,
}

impl ArtifactImporter for Recorder {
    fn import(&mut self, artifact: &LoadedArtifact) -> Result<(), String> {
        if self.reject.as_deref() == Some(artifact.engine.as_str()) {
            return Err(format!("{}: undefined symbol: ram", artifact.engine));
        }
        self.imported.push(artifact.engine.clone());
        Ok(())
    }
}

#[test]
fn project_root_is_detected_from_assets() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let layout = project.layout();
    assert_eq!(layout.root, project.root);
    assert_eq!(layout.prebuilt_root, project.root.join("assets").join("binaries"));
}

#[test]
fn partial_batch_reports_failures_and_keeps_going() {
    let project = Project::new(&[
        ("cpu", "// cpu"),
        ("disc", "#error unsupported\n"),
        ("ram", "// ram"),
    ]);
    let report = project
        .orchestrator()
        .build_all(&request(LoadPolicy::BuildOnly), None)
        .unwrap();

    assert!(report.is_partial());
    assert_eq!(report.artifacts.len(), 2);
    assert!(report.failed["disc"].contains("#error"));
    assert_eq!(report.artifact("cpu").unwrap().status, ArtifactStatus::Rebuilt);
}

#[test]
fn optional_engine_failure_is_skipped() {
    let project = Project::new(&[("cpu", "// cpu"), ("gpu_nvidia", "#error no cuda\n")]);
    let report = project
        .orchestrator()
        .build_all(&request(LoadPolicy::BuildOnly), None)
        .unwrap();
    assert!(!report.is_partial());
    assert!(report.skipped.contains_key("gpu_nvidia"));
}

#[test]
fn named_engine_without_source_fails_only_itself() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let req = BuildRequest {
        engines: Some(vec!["cpu".to_string(), "psu".to_string()]),
        ..request(LoadPolicy::PreferCache)
    };
    let report = project.orchestrator().build_all(&req, None).unwrap();
    assert_eq!(report.artifacts.len(), 1);
    assert!(report.failed["psu"].contains("no source"));
}

#[test]
fn importer_sees_every_artifact_unless_compile_only() {
    let project = Project::new(&[("cpu", "// cpu"), ("ram", "// ram")]);
    let orchestrator = project.orchestrator();

    let mut recorder = Recorder {
        reject: Some("ram".to_string()),
        ..Recorder::default()
    };
    let report = orchestrator
        .build_all(&request(LoadPolicy::PreferCache), Some(&mut recorder as &mut dyn ArtifactImporter))
        .unwrap();
    assert_eq!(recorder.imported, vec!["cpu"]);
    assert!(report.failed["ram"].contains("undefined symbol"));

    let mut recorder = Recorder::default();
    let req = BuildRequest {
        compile_only: true,
        ..request(LoadPolicy::PreferCache)
    };
    let report = orchestrator.build_all(&req, Some(&mut recorder as &mut dyn ArtifactImporter)).unwrap();
    assert!(recorder.imported.is_empty());
    assert!(report.artifacts.iter().all(|a| a.status == ArtifactStatus::UpToDate));
}

#[test]
fn fast_build_backs_up_into_the_durable_store() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let orchestrator = project.orchestrator();
    let out = project.root.join("engines");
    let report = orchestrator.fast_build_all(Some(out.clone()), None).unwrap();
    assert_eq!(report.artifact("cpu").unwrap().path, out.join(binary_file_name("cpu")));

    let key = orchestrator.loader().cache_key().to_string();
    let backup = project.layout().prebuilt_root.join(key).join(binary_file_name("cpu"));
    assert!(backup.is_file());
}

#[test]
fn engine_config_overrides_policy() {
    let project = Project::new(&[("cpu", "// cpu")]);
    std::fs::write(project.src.join("engines.json"), r#"{"cpu": {"policy": "prebuilt_only"}}"#)
        .unwrap();
    let report = project
        .orchestrator()
        .build_all(&request(LoadPolicy::BuildOnly), None)
        .unwrap();
    assert!(report.failed["cpu"].contains("no compatible prebuilt"));
}

#[test]
fn toolchain_snapshot_is_persisted_per_cache_key() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let orchestrator = project.orchestrator();
    let report = orchestrator.snapshot_toolchain(None).unwrap();
    assert!(report.changed);
    assert!(report.path.starts_with(project.root.join(".binforge").join("toolchains")));
    assert!(!orchestrator.snapshot_toolchain(None).unwrap().changed);
}

// ── clean ───────────────────────────────────────────────────────────────────

fn populate_for_clean(project: &Project) -> ProjectLayout {
    let layout = project.layout();
    let keyed = layout.cache_root.join("fbkey");
    std::fs::create_dir_all(&keyed).unwrap();
    std::fs::write(keyed.join(binary_file_name("cpu")), vec![0u8; 64]).unwrap();
    std::fs::write(project.src.join(binary_file_name("cpu")), vec![0u8; 10]).unwrap();
    std::fs::write(project.src.join(binary_file_name("legacy")), vec![0u8; 5]).unwrap();
    std::fs::create_dir_all(project.root.join("build")).unwrap();
    std::fs::write(project.root.join("build").join("cpu.o"), vec![0u8; 7]).unwrap();
    std::fs::write(project.src.join("cpu.o"), vec![0u8; 3]).unwrap();
    std::fs::create_dir_all(project.root.join("tools").join("__pycache__")).unwrap();
    layout
}

#[test]
fn deep_clean_honours_cache_exclusion() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let layout = populate_for_clean(&project);
    let opts = CleanOptions {
        mode: Some(CleanMode::Deep),
        exclude: vec![layout.cache_root.clone()],
        ..CleanOptions::default()
    };
    let report = clean(&layout, &opts, &EventBus::default());

    assert!(report.skipped.contains(&layout.cache_root.display().to_string()));
    assert!(layout.cache_root.join("fbkey").is_dir());
    assert!(!report.removed.iter().any(|p| Path::new(p).starts_with(&layout.cache_root)));
    assert!(!project.root.join("build").exists());
    assert!(!project.root.join("tools").join("__pycache__").exists());
    assert!(!project.src.join(binary_file_name("legacy")).exists());
    assert!(project.src.join("cpu.cpp").is_file());
}

#[test]
fn dry_run_reports_the_same_set_without_touching_disk() {
    let dry_project = Project::new(&[("cpu", "// cpu")]);
    let dry_layout = populate_for_clean(&dry_project);
    let opts = CleanOptions {
        profile: Some(CleanProfile::Release),
        dry_run: true,
        ..CleanOptions::default()
    };
    let dry = clean(&dry_layout, &opts, &EventBus::default());
    assert!(dry.dry_run);
    assert!(dry_layout.cache_root.is_dir());
    assert!(dry_project.root.join("build").join("cpu.o").is_file());

    let real = clean(
        &dry_layout,
        &CleanOptions {
            dry_run: false,
            ..opts
        },
        &EventBus::default(),
    );
    assert_eq!(dry.removed, real.removed);
    assert_eq!(dry.bytes_freed, real.bytes_freed);
    assert_eq!(real.bytes_freed, 64 + 10 + 5 + 7 + 3);
    assert!(!dry_layout.cache_root.exists());
}

#[test]
fn dev_profile_keeps_cache_and_byproducts() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let layout = populate_for_clean(&project);
    let opts = CleanOptions {
        profile: Some(CleanProfile::Dev),
        ..CleanOptions::default()
    };
    let report = clean(&layout, &opts, &EventBus::default());
    assert_eq!(report.profile, "dev");
    assert_eq!(report.mode, CleanMode::Light);
    assert!(layout.cache_root.is_dir());
    assert!(project.root.join("build").is_dir());
    assert!(!project.src.join(binary_file_name("cpu")).exists());
}

// ── prune ───────────────────────────────────────────────────────────────────

fn set_mtime(dir: &Path, when: SystemTime) {
    std::fs::File::open(dir).unwrap().set_modified(when).unwrap();
}

#[test]
fn prune_keeps_newest_versions_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let now = SystemTime::now();
    for (i, key) in ["k0", "k1", "k2", "k3", "k4"].iter().enumerate() {
        let path = dir.path().join(key);
        std::fs::create_dir(&path).unwrap();
        set_mtime(&path, now - Duration::from_secs(3_600 * (i as u64 + 1)));
    }
    let report = prune_at(dir.path(), 2, None, false, now, &EventBus::default());
    assert_eq!(report.kept.len(), 2);
    assert_eq!(report.removed.len(), 3);
    assert!(dir.path().join("k0").is_dir());
    assert!(dir.path().join("k1").is_dir());
    assert!(!dir.path().join("k4").exists());
}

#[test]
fn prune_removes_stale_directory_inside_top_k() {
    let dir = tempfile::tempdir().unwrap();
    let now = SystemTime::now();
    let fresh = dir.path().join("fresh");
    let stale = dir.path().join("stale");
    std::fs::create_dir(&fresh).unwrap();
    std::fs::create_dir(&stale).unwrap();
    set_mtime(&stale, now - Duration::from_secs(86_400 * 45));

    let report = prune_at(dir.path(), 3, Some(30), false, now, &EventBus::default());
    assert_eq!(report.removed, vec![stale.display().to_string()]);
    assert!(fresh.is_dir());
}

// ─────────────────────────────────────────────────────────────────────────────
// Script duties
// ─────────────────────────────────────────────────────────────────────────────

/// `.py` duties are shell scripts here; `sh` stands in for the interpreter.
fn sh_runner(timeout: Option<Duration>) -> ScriptRunner {
    ScriptRunner {
        python: Some("sh".to_string()),
        timeout,
        ..ScriptRunner::default()
    }
}

fn write_scripts(dir: &Path, scripts: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    for (name, body) in scripts {
        std::fs::write(dir.join(name), body).unwrap();
    }
}

#[test]
fn script_output_and_exit_code_are_captured() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(
        dir.path(),
        &[
            ("ok.py", "echo synced\n"),
            ("broken.py", "echo 'disk full' >&2\nexit 3\n"),
        ],
    );
    let bus = EventBus::default();
    let mut events = bus.scoped(&[Topic::Build]);
    let outcomes = sh_runner(None).run_all(dir.path(), None, &bus).unwrap();

    let ok = &outcomes[&dir.path().join("ok.py").display().to_string()];
    assert!(ok.ok);
    assert_eq!(ok.returncode, Some(0));
    assert_eq!(ok.stdout.trim(), "synced");

    let broken = &outcomes[&dir.path().join("broken.py").display().to_string()];
    assert!(!broken.ok);
    assert_eq!(broken.returncode, Some(3));
    assert!(broken.stderr.contains("disk full"));

    let codes: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Diagnostic { code, .. } => Some(code),
            _ => None,
        })
        .collect();
    assert!(codes.iter().any(|c| c == "script:done"));
    assert!(codes.iter().any(|c| c == "script:fail"));
}

#[test]
fn hanging_script_times_out_without_stopping_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path(), &[("a_hang.py", "sleep 5\n"), ("b_ok.py", "true\n")]);
    let started = std::time::Instant::now();
    let outcomes = sh_runner(Some(Duration::from_millis(300)))
        .run_all(dir.path(), None, &EventBus::default())
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));

    let hang = &outcomes[&dir.path().join("a_hang.py").display().to_string()];
    assert!(!hang.ok);
    assert_eq!(hang.returncode, None);
    assert_eq!(hang.stderr, "timeout");
    assert!(outcomes[&dir.path().join("b_ok.py").display().to_string()].ok);
}

#[test]
fn missing_interpreter_and_missing_script_are_recorded_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path(), &[("sync.py", "true\n")]);
    let runner = ScriptRunner {
        python: Some(dir.path().join("no-python").display().to_string()),
        ..ScriptRunner::default()
    };
    let names = vec!["sync.py".to_string(), "gone.py".to_string()];
    let outcomes = runner
        .run_all(dir.path(), Some(&names), &EventBus::default())
        .unwrap();
    assert_eq!(outcomes.len(), 2);

    let sync = &outcomes[&dir.path().join("sync.py").display().to_string()];
    assert!(!sync.ok);
    assert_eq!(sync.returncode, None);
    assert!(sync.stderr.contains("cannot start"));

    let gone = &outcomes[&dir.path().join("gone.py").display().to_string()];
    assert!(!gone.ok);
    assert!(gone.stderr.contains("does not exist"));
}

#[test]
fn duties_build_engines_then_run_scripts() {
    let project = Project::new(&[("cpu", "// cpu"), ("disc", "#error unsupported\n")]);
    let scripts = project.root.join("scripts");
    write_scripts(&scripts, &[("report.py", "exit 1\n"), ("sync.py", "true\n")]);

    let report = project
        .orchestrator()
        .run_duties(
            &request(LoadPolicy::BuildOnly),
            None,
            Some(&scripts),
            None,
            &sh_runner(None),
        )
        .unwrap();
    assert_eq!(report.heavy.artifacts.len(), 1);
    assert!(report.heavy.failed.contains_key("disc"));
    assert_eq!(report.scripts.len(), 2);
    assert_eq!(
        report.failed_scripts(),
        vec![scripts.join("report.py").display().to_string()]
    );
}

#[test]
fn duties_without_script_dir_only_build() {
    let project = Project::new(&[("cpu", "// cpu")]);
    let report = project
        .orchestrator()
        .run_duties(&request(LoadPolicy::BuildOnly), None, None, None, &ScriptRunner::default())
        .unwrap();
    assert_eq!(report.heavy.artifacts.len(), 1);
    assert!(report.scripts.is_empty());
}
