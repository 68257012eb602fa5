//! Layered runtime configuration, generalizing the teacher's single-sandbox
//! `SandboxBuilder` into pool-wide, per-panel and extension-wide knobs
//! (SPEC_FULL.md §B). Loaded via `config` + `serde`: built-in defaults,
//! overridden by an optional `panelrt.toml`/`panelrt.yaml` file, overridden
//! again by `PANELRT__*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub acquire_timeout_ms: u64,
    pub max_memory_bytes: usize,
    pub max_host_calls: u64,
    pub default_timeout_ms: u64,
    pub max_total_execution_ms: u64,
    /// When set, compiled handler sources are persisted under this directory
    /// across process restarts (§4.1's "cache may persist to disk").
    pub compile_cache_dir: Option<String>,
    pub compile_cache_max_bytes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 2,
            max_instances: 16,
            acquire_timeout_ms: 5_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_host_calls: 10_000,
            default_timeout_ms: 2_000,
            max_total_execution_ms: 30_000,
            compile_cache_dir: None,
            compile_cache_max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_total_execution(&self) -> Duration {
        Duration::from_millis(self.max_total_execution_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpExtensionConfig {
    pub enabled: bool,
    pub concurrency_limit: usize,
    pub request_timeout_ms: u64,
    /// `None` means unrestricted; an empty list blocks every host.
    pub allowed_hosts: Option<Vec<String>>,
    pub user_agent: String,
}

impl Default for HttpExtensionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency_limit: 16,
            request_timeout_ms: 10_000,
            allowed_hosts: None,
            user_agent: "panelrt-http-extension/0.1".to_string(),
        }
    }
}

impl HttpExtensionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub http_extension: HttpExtensionConfig,
    pub suspension_timeout_ms: u64,
    /// Open Question E.2: when set, `apply_mutations` for a given panel is
    /// additionally serialized behind a per-panel async mutex, for callers
    /// who want stronger-than-default ordering guarantees across concurrent
    /// invocations. Off by default, matching spec.md §9's documented
    /// resolution (no panel-level lock in the core).
    pub serialize_panel_mutations: bool,
    /// Recomputation-depth guard for chained `ComputedSlot` evaluation
    /// (§4.5's "recomputation-depth limit (e.g., 50)").
    pub computed_max_depth: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            http_extension: HttpExtensionConfig::default(),
            suspension_timeout_ms: 15_000,
            serialize_panel_mutations: false,
            computed_max_depth: 50,
        }
    }
}

impl RuntimeConfig {
    pub fn suspension_timeout(&self) -> Duration {
        Duration::from_millis(self.suspension_timeout_ms)
    }

    /// Builds a layered config: built-in defaults, then an optional
    /// `panelrt.{toml,yaml,json}` file in the current directory, then
    /// `PANELRT__*` environment variables (double underscore separates
    /// nesting, e.g. `PANELRT__POOL__MAX_INSTANCES=32`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&RuntimeConfig::default())?;
        let built = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("panelrt").required(false))
            .add_source(config::Environment::with_prefix("PANELRT").separator("__"))
            .build()?;
        built.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_config() {
        let cfg = config::Config::try_from(&RuntimeConfig::default()).unwrap();
        let parsed: RuntimeConfig = cfg.try_deserialize().unwrap();
        assert_eq!(parsed.pool.max_instances, RuntimeConfig::default().pool.max_instances);
    }
}
