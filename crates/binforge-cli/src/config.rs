//! Configuration Vault – reads/writes `~/.binforge/config.toml`.

use binforge_types::LoadPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Persisted user configuration stored in `~/.binforge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// C++ compiler used for builds and toolchain version queries.
    #[serde(default = "default_compiler")]
    pub compiler: String,

    #[serde(default = "default_language_standard")]
    pub language_standard: String,

    /// Policy of `build` when `--policy` is not given.
    #[serde(default)]
    pub policy: LoadPolicy,

    /// Overrides `<project>/.binforge/cache`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,

    /// Overrides `<project>/assets/binaries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prebuilt_root: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive empty reads before the watchdog tries to heal an engine.
    #[serde(default = "default_heal_threshold")]
    pub heal_threshold: u32,

    #[serde(default = "default_heal_cooldown_ms")]
    pub heal_cooldown_ms: u64,

    /// Engine → engine substituted when it cannot be relinked.
    #[serde(default = "default_fallbacks")]
    pub fallbacks: BTreeMap<String, String>,
}

fn default_compiler() -> String {
    "g++".to_string()
}
fn default_language_standard() -> String {
    "c++17".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_heal_threshold() -> u32 {
    3
}
fn default_heal_cooldown_ms() -> u64 {
    8000
}
fn default_fallbacks() -> BTreeMap<String, String> {
    BTreeMap::from([("gpu_nvidia".to_string(), "gpu_others".to_string())])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compiler: default_compiler(),
            language_standard: default_language_standard(),
            policy: LoadPolicy::default(),
            cache_root: None,
            prebuilt_root: None,
            poll_interval_ms: default_poll_interval_ms(),
            heal_threshold: default_heal_threshold(),
            heal_cooldown_ms: default_heal_cooldown_ms(),
            fallbacks: default_fallbacks(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heal_cooldown(&self) -> Duration {
        Duration::from_millis(self.heal_cooldown_ms)
    }
}

/// Return the path to `~/.binforge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".binforge").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config, falling back to defaults (plus env overrides) when the
/// file is missing or unreadable.
pub fn load_or_default() -> (Config, Option<String>) {
    match load() {
        Ok(Some(cfg)) => (cfg, None),
        Ok(None) => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            (cfg, None)
        }
        Err(e) => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            (cfg, Some(e))
        }
    }
}

/// Apply `BINFORGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BINFORGE_COMPILER` | `compiler` |
/// | `BINFORGE_POLICY` | `policy` |
/// | `BINFORGE_CACHE_ROOT` | `cache_root` |
/// | `BINFORGE_PREBUILT_ROOT` | `prebuilt_root` |
/// | `BINFORGE_POLL_INTERVAL_MS` | `poll_interval_ms` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BINFORGE_COMPILER")
        && !v.trim().is_empty()
    {
        cfg.compiler = v;
    }
    if let Ok(v) = std::env::var("BINFORGE_POLICY")
        && let Ok(policy) = v.parse::<LoadPolicy>()
    {
        cfg.policy = policy;
    }
    if let Ok(v) = std::env::var("BINFORGE_CACHE_ROOT") {
        cfg.cache_root = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("BINFORGE_PREBUILT_ROOT") {
        cfg.prebuilt_root = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("BINFORGE_POLL_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.poll_interval_ms = ms;
    }
}

/// Save the config to disk, creating `~/.binforge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
