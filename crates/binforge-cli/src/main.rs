//! `binforge` – build, cache and supervise native engines.
//!
//! Every subcommand prints a JSON report on stdout and exits `0` on success;
//! logs go to stderr. `monitor` runs the poll loop until Ctrl-C.

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use binforge_builder::{CleanMode, CleanProfile};
use binforge_types::LoadPolicy;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::warn;

/// Build, cache and supervise native engines.
#[derive(Parser, Debug)]
#[command(name = "binforge", version, about = "Native engine build cache and runtime linker")]
pub struct Cli {
    /// Compiler to use instead of the configured one.
    #[arg(long, global = true)]
    pub compiler: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check compiler, include directory, source directory and cache root.
    Healthcheck(SourceArgs),
    /// Resolve every engine with the given policy and link it.
    Build(BuildArgs),
    /// Compile-only build preferring the fast cache, with durable backups.
    FastBuild(FastBuildArgs),
    /// Build the engines, then run the Python/JavaScript script duties.
    Duties(DutiesArgs),
    /// Query and persist the toolchain snapshot.
    Toolchain(SourceArgs),
    /// Remove built binaries, caches and build byproducts.
    Clean(CleanArgs),
    /// Apply the retention policy to the durable store.
    Prune(PruneArgs),
    /// Link the engines this machine needs and poll them under the watchdog.
    Monitor(MonitorArgs),
    /// Print the effective configuration.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Directory containing the engine sources.
    #[arg(long)]
    pub source_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// prefer_prebuilt, prefer_cache, build_only or prebuilt_only.
    #[arg(long)]
    pub policy: Option<LoadPolicy>,

    /// Write binaries here (enables interface guarding).
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Only these engines instead of every discovered source.
    #[arg(long = "engine")]
    pub engines: Vec<String>,

    /// Resolve binaries without linking them.
    #[arg(long)]
    pub compile_only: bool,

    /// Do not back fresh builds up into the durable store.
    #[arg(long)]
    pub no_backup: bool,

    #[arg(long = "compile-flag", allow_hyphen_values = true)]
    pub extra_compile_flags: Vec<String>,

    #[arg(long = "link-flag", allow_hyphen_values = true)]
    pub extra_link_flags: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DutiesArgs {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Directory holding `.py` and `.js` duties; without it only engines run.
    #[arg(long)]
    pub script_dir: Option<PathBuf>,

    /// Only these scripts (file names in the script directory).
    #[arg(long = "script")]
    pub scripts: Vec<String>,

    /// Kill a script after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub python: Option<String>,

    /// JavaScript runtime; defaults to node, bun or deno from `PATH`.
    #[arg(long)]
    pub node: Option<String>,
}

#[derive(Args, Debug)]
pub struct FastBuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// dev, ci or release.
    #[arg(long)]
    pub profile: Option<CleanProfile>,

    /// light, standard or deep.
    #[arg(long)]
    pub mode: Option<CleanMode>,

    #[arg(long)]
    pub no_cache: bool,

    #[arg(long)]
    pub no_local_outputs: bool,

    #[arg(long)]
    pub no_orphans: bool,

    /// Also remove interpreter bytecode caches.
    #[arg(long)]
    pub pycache: bool,

    #[arg(long)]
    pub build_artifacts: bool,

    /// Paths to leave untouched (repeatable).
    #[arg(long)]
    pub exclude: Vec<PathBuf>,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long, default_value_t = binforge_builder::prune::DEFAULT_MAX_VERSIONS)]
    pub max_versions: usize,

    /// `0` disables the age limit.
    #[arg(long, default_value_t = binforge_builder::prune::DEFAULT_MAX_AGE_DAYS)]
    pub max_age_days: u64,

    /// Prune the fast cache instead of the durable store.
    #[arg(long)]
    pub fast_cache: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Where the engine binaries live; defaults to the fast cache entry.
    #[arg(long)]
    pub engines_dir: Option<PathBuf>,

    /// Run a fast build into the engine directory first.
    #[arg(long)]
    pub build: bool,

    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Stop after this many ticks.
    #[arg(long)]
    pub ticks: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Save the effective configuration to `~/.binforge/config.toml`.
    #[arg(long)]
    pub write: bool,
}

fn main() -> ExitCode {
    let _guard = binforge_runtime::init_tracing("binforge");
    let cli = Cli::parse();

    let (cfg, load_error) = config::load_or_default();
    if let Some(e) = load_error {
        warn!(error = %e, path = %config::config_path().display(), "using default configuration");
    }

    match commands::run(cli, &cfg) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
