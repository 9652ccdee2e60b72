//! Subcommand implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use binforge_builder::{
    ArtifactImporter, BuildRequest, CleanOptions, Orchestrator, ProjectLayout, ScriptRunner,
    clean, compat_report, healthcheck, prune,
};
use binforge_hal::{Linker, NativeLoader};
use binforge_kernel::{Watchdog, WatchdogConfig};
use binforge_middleware::EventBus;
use binforge_runtime::PollLoop;
use binforge_types::Reading;
use colored::Colorize;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::{BuildArgs, CleanArgs, Cli, Command, DutiesArgs, MonitorArgs, PruneArgs};

pub fn run(cli: Cli, cfg: &Config) -> Result<ExitCode, String> {
    let compiler = cli.compiler.unwrap_or_else(|| cfg.compiler.clone());
    let bus = EventBus::default();
    match cli.command {
        Command::Healthcheck(args) => {
            let report = healthcheck(&layout(&args.source_dir, cfg), &compiler);
            print_json(&report)?;
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Build(args) => build(args, cfg, compiler, bus),
        Command::Duties(args) => duties(args, cfg, compiler, bus),
        Command::FastBuild(args) => {
            let orchestrator = orchestrator(&args.source.source_dir, cfg, &compiler, bus);
            let report = orchestrator
                .fast_build_all(args.output_dir, None)
                .map_err(|e| e.to_string())?;
            summarize(report.artifacts.len(), report.failed.keys());
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Toolchain(args) => {
            let orchestrator = orchestrator(&args.source_dir, cfg, &compiler, bus);
            let report = orchestrator
                .snapshot_toolchain(None)
                .map_err(|e| e.to_string())?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Clean(args) => {
            let layout = layout(&args.source.source_dir, cfg);
            let report = clean(&layout, &clean_options(args), &bus);
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune(args) => prune_command(args, cfg, bus),
        Command::Monitor(args) => monitor(args, cfg, compiler, bus),
        Command::Config(args) => {
            if args.write {
                config::save(cfg)?;
                eprintln!(
                    "  {} Config saved to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                );
            }
            print_json(cfg)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn layout(source_dir: &Path, cfg: &Config) -> ProjectLayout {
    ProjectLayout::discover(source_dir)
        .with_cache_root(cfg.cache_root.clone())
        .with_prebuilt_root(cfg.prebuilt_root.clone())
}

fn orchestrator(source_dir: &Path, cfg: &Config, compiler: &str, bus: EventBus) -> Orchestrator {
    Orchestrator::new(layout(source_dir, cfg), bus)
        .with_compiler(compiler)
        .with_language_standard(cfg.language_standard.clone())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn summarize<'a>(ready: usize, failed: impl Iterator<Item = &'a String>) {
    let failed: Vec<&str> = failed.map(String::as_str).collect();
    if failed.is_empty() {
        eprintln!("  {} {ready} engine(s) ready", "✓".green().bold());
    } else {
        eprintln!(
            "  {} {ready} engine(s) ready, {} failed: {}",
            "!".yellow().bold(),
            failed.len(),
            failed.join(", ").red()
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// build
// ─────────────────────────────────────────────────────────────────────────────

fn build_request(args: BuildArgs, cfg: &Config, compiler: String) -> BuildRequest {
    BuildRequest {
        engines: (!args.engines.is_empty()).then_some(args.engines),
        policy: args.policy.unwrap_or(cfg.policy),
        compile_only: args.compile_only,
        output_dir: args.output_dir,
        compiler: Some(compiler),
        extra_compile_flags: args.extra_compile_flags,
        extra_link_flags: args.extra_link_flags,
        save_prebuilt: !args.no_backup,
        ..BuildRequest::default()
    }
}

/// Where a linking build imports its binaries from.
fn engines_dir(orchestrator: &Orchestrator, req: &BuildRequest) -> PathBuf {
    match &req.output_dir {
        Some(dir) => dir.clone(),
        None => orchestrator
            .loader()
            .default_target_dir(&orchestrator.base_options(req)),
    }
}

fn build(args: BuildArgs, cfg: &Config, compiler: String, bus: EventBus) -> Result<ExitCode, String> {
    let orchestrator = orchestrator(&args.source.source_dir, cfg, &compiler, bus.clone());
    let req = build_request(args, cfg, compiler);

    let report = if req.compile_only {
        orchestrator.build_all(&req, None)
    } else {
        let mut linker = Linker::new(engines_dir(&orchestrator, &req), NativeLoader::new(), bus);
        orchestrator.build_all(&req, Some(&mut linker as &mut dyn ArtifactImporter))
    }
    .map_err(|e| e.to_string())?;

    summarize(report.artifacts.len(), report.failed.keys());
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

fn duties(args: DutiesArgs, cfg: &Config, compiler: String, bus: EventBus) -> Result<ExitCode, String> {
    let orchestrator = orchestrator(&args.build.source.source_dir, cfg, &compiler, bus.clone());
    let req = build_request(args.build, cfg, compiler);
    let runner = ScriptRunner {
        python: args.python,
        node: args.node,
        cwd: None,
        timeout: args.timeout_secs.map(Duration::from_secs),
    };
    let names = (!args.scripts.is_empty()).then_some(args.scripts);
    let script_dir = args.script_dir.as_deref();

    let report = if req.compile_only {
        orchestrator.run_duties(&req, None, script_dir, names.as_deref(), &runner)
    } else {
        let mut linker = Linker::new(engines_dir(&orchestrator, &req), NativeLoader::new(), bus);
        orchestrator.run_duties(
            &req,
            Some(&mut linker as &mut dyn ArtifactImporter),
            script_dir,
            names.as_deref(),
            &runner,
        )
    }
    .map_err(|e| e.to_string())?;

    summarize(report.heavy.artifacts.len(), report.heavy.failed.keys());
    let failed = report.failed_scripts();
    if failed.is_empty() {
        eprintln!("  {} {} script duty(ies) done", "✓".green().bold(), report.scripts.len());
    } else {
        eprintln!(
            "  {} {} of {} script duty(ies) failed: {}",
            "!".yellow().bold(),
            failed.len(),
            report.scripts.len(),
            failed.join(", ").red()
        );
    }
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// clean / prune
// ─────────────────────────────────────────────────────────────────────────────

fn clean_options(args: CleanArgs) -> CleanOptions {
    let off = |flag: bool| flag.then_some(false);
    let on = |flag: bool| flag.then_some(true);
    CleanOptions {
        profile: args.profile,
        mode: args.mode,
        cache: off(args.no_cache),
        local_outputs: off(args.no_local_outputs),
        orphans: off(args.no_orphans),
        build_artifacts: on(args.build_artifacts),
        bytecode: on(args.pycache),
        exclude: args.exclude,
        dry_run: args.dry_run,
    }
}

fn prune_command(args: PruneArgs, cfg: &Config, bus: EventBus) -> Result<ExitCode, String> {
    let layout = layout(&args.source.source_dir, cfg);
    let root: PathBuf = if args.fast_cache {
        layout.cache_root
    } else {
        layout.prebuilt_root
    };
    let max_age = (args.max_age_days > 0).then_some(args.max_age_days);
    let report = prune(&root, args.max_versions, max_age, args.dry_run, &bus);
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// monitor
// ─────────────────────────────────────────────────────────────────────────────

fn monitor(args: MonitorArgs, cfg: &Config, compiler: String, bus: EventBus) -> Result<ExitCode, String> {
    let orchestrator = orchestrator(&args.source.source_dir, cfg, &compiler, bus.clone());
    let engines_dir = args.engines_dir.unwrap_or_else(|| {
        orchestrator
            .loader()
            .default_target_dir(&orchestrator.base_options(&BuildRequest::default()))
    });

    match serde_json::to_string(&compat_report()) {
        Ok(report) => info!(report = %report, "runtime compatibility"),
        Err(e) => warn!(error = %e, "compatibility report unavailable"),
    }

    if args.build {
        let report = orchestrator
            .fast_build_all(Some(engines_dir.clone()), None)
            .map_err(|e| e.to_string())?;
        summarize(report.artifacts.len(), report.failed.keys());
    }

    let mut linker =
        Linker::new(&engines_dir, NativeLoader::new(), bus.clone()).with_hotfix(orchestrator);
    let engines = linker.discover_required_engines();
    if engines.is_empty() {
        return Err(format!(
            "no engine binaries in {} (try --build)",
            engines_dir.display()
        ));
    }
    for engine in &engines {
        if !linker.link(engine) {
            warn!(engine = %engine, "initial link failed; the watchdog will retry");
        }
    }

    let mut watchdog = Watchdog::new(
        WatchdogConfig {
            threshold: cfg.heal_threshold,
            cooldown: cfg.heal_cooldown(),
            fallbacks: cfg.fallbacks.clone(),
        },
        bus.clone(),
    );
    watchdog.set_active(engines);

    let interval = args
        .interval_ms
        .map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or_else(|| cfg.poll_interval());
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "Ctrl-C received, stopping monitor".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let mut poll = PollLoop::new(watchdog, bus, interval).with_shutdown(shutdown);
    if let Some(ticks) = args.ticks {
        poll = poll.with_max_ticks(ticks);
    }
    poll.run(&mut linker, print_readings);
    Ok(ExitCode::SUCCESS)
}

fn format_reading(reading: &Reading) -> String {
    match reading {
        Reading::Scalar(v) => format!("{v:.1}"),
        Reading::Channels(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={v:.1}"))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn print_readings(tick: u64, readings: &BTreeMap<String, Reading>) {
    let line: Vec<String> = readings
        .iter()
        .map(|(engine, reading)| format!("{} {}", engine.bold(), format_reading(reading)))
        .collect();
    println!("{} {}", format!("#{tick}").dimmed(), line.join("  "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceArgs;

    #[test]
    fn clean_flags_only_override_when_given() {
        let args = CleanArgs {
            source: SourceArgs {
                source_dir: PathBuf::from("native"),
            },
            profile: None,
            mode: None,
            no_cache: true,
            no_local_outputs: false,
            no_orphans: false,
            pycache: true,
            build_artifacts: false,
            exclude: vec![],
            dry_run: true,
        };
        let opts = clean_options(args);
        assert_eq!(opts.cache, Some(false));
        assert_eq!(opts.local_outputs, None);
        assert_eq!(opts.bytecode, Some(true));
        assert_eq!(opts.build_artifacts, None);
        assert!(opts.dry_run);
    }

    #[test]
    fn readings_format_compactly() {
        assert_eq!(format_reading(&Reading::Scalar(12.345)), "12.3");
        let channels = Reading::Channels(BTreeMap::from([
            ("sda".to_string(), 1.0),
            ("sdb".to_string(), 2.5),
        ]));
        assert_eq!(format_reading(&channels), "sda=1.0 sdb=2.5");
    }

    #[test]
    fn layout_honours_configured_roots() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            cache_root: Some(dir.path().join("c")),
            prebuilt_root: Some(dir.path().join("p")),
            ..Config::default()
        };
        let layout = layout(&dir.path().join("native"), &cfg);
        assert_eq!(layout.cache_root, dir.path().join("c"));
        assert_eq!(layout.prebuilt_root, dir.path().join("p"));
    }
}
