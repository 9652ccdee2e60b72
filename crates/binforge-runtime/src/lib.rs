//! `binforge-runtime` – process plumbing for a host that runs engines
//!
//! # Modules
//!
//! - [`poll_loop`] – [`PollLoop`][poll_loop::PollLoop]: the periodic timer
//!   tick that reads every active engine through the
//!   [`Watchdog`][binforge_kernel::Watchdog] and publishes the readings on
//!   the telemetry topic.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export to
//!   any OTLP-compatible collector.

pub mod poll_loop;
pub mod telemetry;

pub use poll_loop::PollLoop;
pub use telemetry::{TracerProviderGuard, init_tracing};
