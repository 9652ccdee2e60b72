//! `binforge-hal` – runtime linker for native engines
//!
//! Loads compiled engines into the host process and exposes them through a
//! small closed set of typed capabilities instead of free-form reflection.
//!
//! # Modules
//!
//! - [`capability`] – [`ScalarSensor`] / [`MultiChannelSensor`] and the
//!   [`LoadedModule`] handle that dispatches over them.
//! - [`native`] – the C ABI ([`native::EngineDescriptor`]) and the
//!   dynamic-library [`NativeLoader`].
//! - [`registry`] – [`ModuleRegistry`], engine name → loaded module.
//! - [`detect`] – environment checks deciding which engines this machine needs.
//! - [`linker`] – [`Linker`]: link, bounded self-repair, lazy invoke.
//! - [`error`] – [`LinkError`] and [`InvokeError`].

pub mod capability;
pub mod detect;
pub mod error;
pub mod linker;
pub mod native;
pub mod registry;

pub use capability::{EngineHandle, LoadedModule, MultiChannelSensor, ScalarSensor};
pub use detect::{SysRoot, discover_required_engines};
pub use error::{InvokeError, LinkError};
pub use linker::{HotfixBuilder, Linker, ModuleLoader};
pub use native::NativeLoader;
pub use registry::ModuleRegistry;
