//! [`Watchdog`] – engine health monitor.
//!
//! Every poll tick each active engine is read once through an
//! [`EngineHost`]. A missing or empty reading extends the engine's failure
//! streak; any accepted reading resets it.
//!
//! ```text
//! Healthy ──(threshold failures)──▶ HealPending ──(cooldown elapsed)──▶ Healing
//!    ▲                                                                  │
//!    └──────────── relink ok / fallback linked ─────────────────────────┤
//!                                                                       ▼
//!                                      HealFailed (streak = threshold - 1)
//! ```
//!
//! Heal attempts are rate limited per engine by the cooldown, so a broken
//! engine costs at most one relink (and possibly one rebuild) per window.
//! All state is in memory; a new watchdog starts with a clean slate.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use binforge_hal::Linker;
use binforge_middleware::{EventBus, Topic};
use binforge_types::{EventPayload, Reading};
use tracing::{debug, info, warn};

const SOURCE: &str = "binforge-kernel::watchdog";

pub const DEFAULT_HEAL_THRESHOLD: u32 = 3;
pub const DEFAULT_HEAL_COOLDOWN: Duration = Duration::from_secs(8);

// ────────────────────────────────────────────────────────────────────────────
// Host seam
// ────────────────────────────────────────────────────────────────────────────

/// What the watchdog needs from the process hosting the engines.
pub trait EngineHost {
    /// One read; `None` means no data.
    fn poll(&mut self, engine: &str) -> Option<Reading>;
    /// Load the engine again; `true` on success.
    fn relink(&mut self, engine: &str) -> bool;
}

impl EngineHost for Linker {
    fn poll(&mut self, engine: &str) -> Option<Reading> {
        self.invoke(engine)
    }

    fn relink(&mut self, engine: &str) -> bool {
        self.link(engine)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    Healthy,
    /// Threshold reached, waiting for the cooldown to elapse.
    HealPending,
    Healing,
    /// Last heal attempt failed; re-evaluated on the next failure after cooldown.
    HealFailed,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub threshold: u32,
    pub cooldown: Duration,
    /// Engine → generic engine substituted when the engine cannot be relinked.
    pub fallbacks: BTreeMap<String, String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_HEAL_THRESHOLD,
            cooldown: DEFAULT_HEAL_COOLDOWN,
            fallbacks: BTreeMap::from([("gpu_nvidia".to_string(), "gpu_others".to_string())]),
        }
    }
}

#[derive(Debug, Clone)]
struct EngineState {
    streak: u32,
    last_heal_attempt: Option<Instant>,
    health: EngineHealth,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            streak: 0,
            last_heal_attempt: None,
            health: EngineHealth::Healthy,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

pub struct Watchdog {
    config: WatchdogConfig,
    active: Vec<String>,
    states: HashMap<String, EngineState>,
    bus: EventBus,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, bus: EventBus) -> Self {
        Self {
            config,
            active: Vec::new(),
            states: HashMap::new(),
            bus,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Replace the polled working set.
    pub fn set_active<I, S>(&mut self, engines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active = engines.into_iter().map(Into::into).collect();
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn streak(&self, engine: &str) -> u32 {
        self.states.get(engine).map_or(0, |s| s.streak)
    }

    pub fn health(&self, engine: &str) -> EngineHealth {
        self.states
            .get(engine)
            .map_or(EngineHealth::Healthy, |s| s.health)
    }

    /// Poll every active engine once and return the accepted readings.
    pub fn tick(&mut self, host: &mut dyn EngineHost) -> BTreeMap<String, Reading> {
        self.tick_at(host, Instant::now())
    }

    /// [`tick`](Self::tick) with an explicit clock.
    pub fn tick_at(&mut self, host: &mut dyn EngineHost, now: Instant) -> BTreeMap<String, Reading> {
        let mut readings = BTreeMap::new();
        // Healing may splice a fallback into `active` mid-tick.
        for engine in self.active.clone() {
            match host.poll(&engine) {
                Some(reading) if !reading.is_empty() => {
                    self.mark_ok(&engine);
                    readings.insert(engine, reading);
                }
                _ => self.mark_fail(host, &engine, now),
            }
        }
        readings
    }

    pub fn mark_ok(&mut self, engine: &str) {
        let state = self.states.entry(engine.to_string()).or_default();
        state.streak = 0;
        state.health = EngineHealth::Healthy;
    }

    pub fn mark_fail(&mut self, host: &mut dyn EngineHost, engine: &str, now: Instant) {
        let threshold = self.config.threshold;
        let state = self.states.entry(engine.to_string()).or_default();
        state.streak += 1;
        debug!(engine, streak = state.streak, "engine returned no data");
        if state.streak >= threshold {
            self.try_heal(host, engine, now);
        }
    }

    fn try_heal(&mut self, host: &mut dyn EngineHost, engine: &str, now: Instant) {
        let cooldown = self.config.cooldown;
        let state = self.states.entry(engine.to_string()).or_default();
        if let Some(last) = state.last_heal_attempt
            && now.saturating_duration_since(last) < cooldown
        {
            if state.health == EngineHealth::Healthy {
                state.health = EngineHealth::HealPending;
            }
            return;
        }
        state.last_heal_attempt = Some(now);
        state.health = EngineHealth::Healing;

        info!(engine, "watchdog relinking engine");
        if host.relink(engine) {
            self.mark_ok(engine);
            self.healed(engine, None);
            return;
        }

        if let Some(fallback) = self.config.fallbacks.get(engine).cloned()
            && host.relink(&fallback)
        {
            info!(engine, fallback = %fallback, "substituting fallback engine");
            self.replace_active(engine, &fallback);
            self.mark_ok(engine);
            self.mark_ok(&fallback);
            self.healed(engine, Some(fallback));
            return;
        }

        let pinned = self.config.threshold.saturating_sub(1);
        let state = self.states.entry(engine.to_string()).or_default();
        state.streak = pinned;
        state.health = EngineHealth::HealFailed;
        warn!(engine, streak = pinned, "heal failed, engine stays degraded");
        self.bus.emit(
            Topic::Watchdog,
            SOURCE,
            EventPayload::EngineDegraded {
                engine: engine.to_string(),
                streak: pinned,
            },
        );
    }

    /// Put `new` where `old` was. Appends `new` when `old` is not active; never
    /// lists an engine twice.
    pub fn replace_active(&mut self, old: &str, new: &str) {
        let already = self.active.iter().any(|e| e == new);
        match self.active.iter().position(|e| e == old) {
            Some(pos) if already => {
                self.active.remove(pos);
            }
            Some(pos) => self.active[pos] = new.to_string(),
            None if !already => self.active.push(new.to_string()),
            None => {}
        }
    }

    fn healed(&self, engine: &str, replacement: Option<String>) {
        self.bus.emit(
            Topic::Watchdog,
            SOURCE,
            EventPayload::EngineHealed {
                engine: engine.to_string(),
                replacement,
            },
        );
    }
}
