//! `binforge-kernel` – engine supervision
//!
//! Keeps a running host self-healing when a loaded engine stops producing
//! data.
//!
//! # Modules
//!
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: per-engine failure
//!   streaks, rate-limited relinks and fallback substitution, driven once
//!   per poll tick through an [`EngineHost`][watchdog::EngineHost].

pub mod watchdog;

pub use watchdog::{EngineHealth, EngineHost, Watchdog, WatchdogConfig};
