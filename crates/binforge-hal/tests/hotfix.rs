//! Self-repair through the real build orchestrator with a stand-in compiler.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use binforge_builder::{ArtifactImporter, BuildRequest, Orchestrator, ProjectLayout};
use binforge_cache::binary_file_name;
use binforge_hal::{InvokeError, LinkError, LoadedModule, Linker, ModuleLoader, ScalarSensor};
use binforge_middleware::EventBus;
use binforge_types::{LoadPolicy, Reading};

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
echo "$src" >> "$(dirname "$0")/cc.log"
cp "$src" "$out"
"#;

fn compiles(root: &Path) -> usize {
    std::fs::read_to_string(root.join("cc.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

struct Constant;
impl ScalarSensor for Constant {
    fn read_scalar(&mut self) -> Result<f64, InvokeError> {
        Ok(1.5)
    }
}

/// A binary "loads" when its content is exactly `ok`.
struct TextLoader;
impl ModuleLoader for TextLoader {
    fn load(&self, engine: &str, path: &Path) -> Result<LoadedModule, LinkError> {
        let content = std::fs::read_to_string(path).map_err(|e| LinkError::classify(e.to_string()))?;
        if content.trim() == "ok" {
            Ok(LoadedModule::scalar(engine, Constant))
        } else {
            Err(LinkError::classify(content))
        }
    }
}

fn orchestrator(root: &Path) -> Orchestrator {
    let src = root.join("native");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::create_dir_all(root.join("assets")).unwrap();
    std::fs::write(src.join("cpu.cpp"), "ok\n").unwrap();
    let compiler = root.join("cc.sh");
    std::fs::write(&compiler, FAKE_COMPILER).unwrap();
    std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();
    Orchestrator::new(ProjectLayout::discover(&src), EventBus::default())
        .with_compiler(compiler.display().to_string())
}

#[test]
fn hotfix_restores_broken_binary_from_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let orchestrator = orchestrator(&root);
    let engines = root.join("engines");

    // A guarded fast build leaves a binary, a matching sidecar and a durable
    // backup.
    let req = BuildRequest {
        snapshot_toolchain: false,
        ..BuildRequest::fast(Some(engines.clone()))
    };
    orchestrator.build_all(&req, None).unwrap();
    assert_eq!(compiles(&root), 1);
    let live = engines.join(binary_file_name("cpu"));
    std::fs::write(&live, "wrong ELF class: ELFCLASS32").unwrap();

    let mut linker = Linker::new(&engines, TextLoader, EventBus::default()).with_hotfix(orchestrator);
    assert!(linker.link("cpu"));
    assert!(linker.hotfix_attempted("cpu"));
    assert_eq!(compiles(&root), 1);
    assert_eq!(std::fs::read_to_string(&live).unwrap().trim(), "ok");
    assert_eq!(linker.call("cpu").unwrap(), Reading::Scalar(1.5));
}

#[test]
fn hotfix_recompiles_when_no_backup_exists() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let orchestrator = orchestrator(&root);
    let engines = root.join("engines");

    let req = BuildRequest {
        snapshot_toolchain: false,
        save_prebuilt: false,
        ..BuildRequest::fast(Some(engines.clone()))
    };
    orchestrator.build_all(&req, None).unwrap();
    assert_eq!(compiles(&root), 1);
    assert!(!root.join("assets").join("binaries").exists());

    // Newer than the source and still carrying a valid sidecar.
    let live = engines.join(binary_file_name("cpu"));
    std::fs::write(&live, "wrong ELF class: ELFCLASS32").unwrap();

    let mut linker = Linker::new(&engines, TextLoader, EventBus::default()).with_hotfix(orchestrator);
    assert!(linker.link("cpu"));
    assert_eq!(compiles(&root), 2);
    assert_eq!(std::fs::read_to_string(&live).unwrap().trim(), "ok");
    assert_eq!(linker.call("cpu").unwrap(), Reading::Scalar(1.5));
}

#[test]
fn batch_import_links_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let orchestrator = orchestrator(&root);
    let engines = root.join("engines");

    let mut linker = Linker::new(&engines, TextLoader, EventBus::default());
    let req = BuildRequest {
        policy: LoadPolicy::BuildOnly,
        output_dir: Some(engines.clone()),
        snapshot_toolchain: false,
        ..BuildRequest::default()
    };
    let report = orchestrator.build_all(&req, Some(&mut linker as &mut dyn ArtifactImporter)).unwrap();
    assert!(!report.is_partial());
    assert!(linker.is_linked("cpu"));
}
