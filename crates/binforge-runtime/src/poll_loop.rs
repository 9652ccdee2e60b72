//! [`PollLoop`] – the periodic tick of a monitoring host.
//!
//! Each tick reads every active engine through the [`Watchdog`] (which also
//! heals engines that stopped producing data) and publishes the accepted
//! readings as one [`EventPayload::Telemetry`] event. The loop runs on the
//! calling thread and stops when its shutdown flag is raised.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use binforge_kernel::{EngineHost, Watchdog};
use binforge_middleware::{EventBus, Topic};
use binforge_types::{EventPayload, Reading};
use tracing::{debug, info};

const SOURCE: &str = "binforge-runtime::poll_loop";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Longest single sleep, so a shutdown request is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub struct PollLoop {
    watchdog: Watchdog,
    bus: EventBus,
    interval: Duration,
    max_ticks: Option<u64>,
    shutdown: Arc<AtomicBool>,
}

impl PollLoop {
    pub fn new(watchdog: Watchdog, bus: EventBus, interval: Duration) -> Self {
        Self {
            watchdog,
            bus,
            interval,
            max_ticks: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop on its own after `ticks` ticks.
    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    /// Share an existing flag (e.g. one set from a Ctrl-C handler).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn watchdog_mut(&mut self) -> &mut Watchdog {
        &mut self.watchdog
    }

    /// One tick: poll, heal, publish.
    pub fn tick(&mut self, host: &mut dyn EngineHost) -> BTreeMap<String, Reading> {
        let readings = self.watchdog.tick(host);
        self.bus.emit(
            Topic::Telemetry,
            SOURCE,
            EventPayload::Telemetry(readings.clone()),
        );
        readings
    }

    /// Tick until shutdown (or `max_ticks`), calling `on_tick` with the tick
    /// number and readings. Returns the number of ticks run.
    pub fn run<F>(&mut self, host: &mut dyn EngineHost, mut on_tick: F) -> u64
    where
        F: FnMut(u64, &BTreeMap<String, Reading>),
    {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            engines = ?self.watchdog.active(),
            "poll loop started"
        );
        let mut ticks = 0u64;
        while !self.stopping(ticks) {
            let started = Instant::now();
            let readings = self.tick(host);
            ticks += 1;
            on_tick(ticks, &readings);
            if self.stopping(ticks) {
                break;
            }
            self.sleep_until(started + self.interval);
        }
        info!(ticks, "poll loop stopped");
        ticks
    }

    fn stopping(&self, ticks: u64) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.max_ticks.is_some_and(|max| ticks >= max)
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("shutdown requested during sleep");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
