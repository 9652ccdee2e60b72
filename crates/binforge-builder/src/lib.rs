//! `binforge-builder` – build orchestration and workspace hygiene
//!
//! Batches [`binforge_cache::Loader::resolve`] over every engine of a source
//! directory and owns everything that operates on whole directories.
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`layout`] | Project root detection and default cache/store locations |
//! | [`discovery`] | Finding build units in a source directory |
//! | [`config`] | `engines.json` per-engine overrides |
//! | [`toolchain`] | Bounded version queries and the persisted toolchain snapshot |
//! | [`orchestrator`] | `build_all` / `fast_build_all` / `run_duties` and the [`BuildReport`] |
//! | [`duties`] | Python/JavaScript script duties under a timeout |
//! | [`clean`] | Profile/mode driven workspace cleanup |
//! | [`prune`] | Retention policy for durable-store version directories |
//! | [`health`] | `healthcheck` and the runtime compatibility report |

pub mod clean;
pub mod config;
pub mod discovery;
pub mod duties;
pub mod error;
pub mod health;
pub mod layout;
pub mod orchestrator;
pub mod prune;
pub mod toolchain;

pub use clean::{CleanMode, CleanOptions, CleanProfile, CleanReport, clean};
pub use config::{EngineConfig, EngineOverrides};
pub use discovery::{discover_scripts, discover_units};
pub use duties::{DutiesReport, ScriptOutcome, ScriptRunner};
pub use error::BuilderError;
pub use health::{compat_report, healthcheck};
pub use layout::ProjectLayout;
pub use orchestrator::{ArtifactImporter, BuildReport, BuildRequest, Orchestrator};
pub use prune::{PruneReport, prune, prune_at};
pub use toolchain::{
    BoundedError, BoundedOutput, ToolchainReport, ToolchainSnapshot, run_bounded, snapshot_toolchain,
};
