//! `binforge-middleware` – diagnostics plumbing
//!
//! Routes build, cache, link, and watchdog events from the components that
//! produce them to whoever is listening (a console, a UI, a test), without
//! any component reaching for a process-wide singleton.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels, plus [`ScopedSubscription`][bus::ScopedSubscription]
//!   for subscribing around a single unit of work.

pub mod bus;

pub use bus::{EventBus, ScopedSubscription, Topic, TopicReceiver};
