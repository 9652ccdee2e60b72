//! Per-engine overrides from `engines.json`.
//!
//! ```json
//! {
//!   "gpu_nvidia": { "extra_link_args": ["-lnvidia-ml"], "policy": "build_only" },
//!   "cpu":        { "compiler": "clang++" }
//! }
//! ```
//!
//! List flags are appended to the call-level flags; `compiler` and `policy`
//! replace the call-level values. A missing file is an empty config; a file
//! that is not a JSON object is an empty config plus a warning. Inside the
//! object, non-object entries and wrongly typed fields are dropped one by
//! one with a warning, so the rest of the file still applies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use binforge_cache::ResolveOptions;
use binforge_types::LoadPolicy;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

pub const ENGINE_CONFIG_FILE: &str = "engines.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineOverrides {
    #[serde(default)]
    pub compiler: Option<String>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub extra_compile_args: Vec<String>,
    #[serde(default)]
    pub extra_link_args: Vec<String>,
}

impl EngineOverrides {
    /// Known fields of one entry; a field of the wrong type is dropped.
    fn from_fields(engine: &str, mut fields: Map<String, Value>) -> Self {
        Self {
            compiler: field(engine, &mut fields, "compiler"),
            policy: field(engine, &mut fields, "policy"),
            extra_compile_args: field(engine, &mut fields, "extra_compile_args").unwrap_or_default(),
            extra_link_args: field(engine, &mut fields, "extra_link_args").unwrap_or_default(),
        }
    }
}

fn field<T: DeserializeOwned>(engine: &str, fields: &mut Map<String, Value>, name: &str) -> Option<T> {
    let value = fields.remove(name)?;
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value)
        .map_err(|e| warn!(engine, field = name, error = %e, "ignoring engine config field"))
        .ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    engines: BTreeMap<String, EngineOverrides>,
}

impl EngineConfig {
    pub fn default_path(source_dir: &Path) -> PathBuf {
        source_dir.join(ENGINE_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(entries)) => entries,
            Ok(_) => {
                warn!(path = %path.display(), "engine config must be a JSON object");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed engine config");
                return Self::default();
            }
        };

        let engines = entries
            .into_iter()
            .filter_map(|(engine, value)| match value {
                Value::Object(fields) => {
                    let overrides = EngineOverrides::from_fields(&engine, fields);
                    Some((engine, overrides))
                }
                _ => {
                    warn!(engine = %engine, "skipping non-object engine config entry");
                    None
                }
            })
            .collect();
        Self { engines }
    }

    pub fn get(&self, engine: &str) -> Option<&EngineOverrides> {
        self.engines.get(engine)
    }

    /// Options and policy for `engine`, starting from the call-level values.
    pub fn apply(
        &self,
        engine: &str,
        base: &ResolveOptions,
        policy: LoadPolicy,
    ) -> (ResolveOptions, LoadPolicy) {
        let mut opts = base.clone();
        let Some(overrides) = self.get(engine) else {
            return (opts, policy);
        };
        if let Some(compiler) = overrides.compiler.as_ref().filter(|c| !c.trim().is_empty()) {
            opts.compiler = compiler.clone();
        }
        opts.extra_compile_flags
            .extend(overrides.extra_compile_args.iter().cloned());
        opts.extra_link_flags
            .extend(overrides.extra_link_args.iter().cloned());

        let policy = match overrides.policy.as_deref() {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(engine, error = %e, "ignoring per-engine policy");
                policy
            }),
            None => policy,
        };
        (opts, policy)
    }
}
