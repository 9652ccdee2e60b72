//! `binforge-cache` – runtime identity, artifact cache and loader
//!
//! Turns an engine name into a binary that is safe to load in this process,
//! either by restoring a known-good copy or by compiling the source.
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`identity`] | Process fingerprint and the cache key derived from it |
//! | [`manifest`] | Per-directory `manifest.json` with fingerprint fields and content hashes |
//! | [`sidecar`] | `<binary>.abi.json` interface sidecars |
//! | [`hash`] | SHA-256 content hashing |
//! | [`compiler`] | The single-subprocess compile step with atomic install |
//! | [`loader`] | Policy-driven `resolve` over durable store, fast cache and compiler |
//! | [`error`] | [`CacheError`] and [`LoaderError`] |

pub mod compiler;
pub mod error;
pub mod hash;
pub mod identity;
pub mod loader;
pub mod manifest;
pub mod sidecar;

pub use error::{CacheError, LoaderError};
pub use identity::{cache_key, cache_key_for, fingerprint, manifest_compatible};
pub use loader::{LoadedArtifact, Loader, ResolveOptions, binary_file_name};
pub use manifest::Manifest;
pub use sidecar::InterfaceSidecar;
