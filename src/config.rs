//! Pool configuration.
//!
//! Configuration arrives already built (sources are the host's concern); this
//! module provides the struct, builder-style setters, and environment
//! overrides for hosts that want them.

use serde_json::{json, Value};

/// Configuration for the compiler pool. Immutable once the pool is built.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Log extended diagnostics (source + compiler output) on bad units and
    /// transport failures.
    pub verbose_errors: bool,
    /// Extra attempts after the first when a worker fails mid-compile.
    pub max_retries: u64,
    /// Number of worker subprocesses. Zero disables the pool.
    pub workers: usize,
    /// Command line used to start the compiler subprocess (run via `sh -c`).
    /// Empty disables the pool.
    pub command: String,
    /// Forward the host's settings to each worker after the handshake.
    pub inherit_config: bool,
    /// Restart a worker after this many compilations. Zero means never.
    pub reset_after: u64,
    /// Host global settings, pre-serialized as JSON. Sent as the first
    /// config frame body when `inherit_config` is on.
    pub bound_config: String,
    /// Supplementary settings that have no place in `bound_config`, built
    /// with [`ConfigBuilder`]. Second config frame body.
    pub misc_config: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            verbose_errors: false,
            max_retries: 0,
            workers: 0,
            command: String::new(),
            inherit_config: true,
            reset_after: 0,
            bound_config: String::new(),
            misc_config: String::new(),
        }
    }
}

impl PoolConfig {
    /// Create a config for the given compiler command with default settings
    /// and one worker.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workers: 1,
            ..Self::default()
        }
    }

    /// Whether this configuration enables the pool at all.
    pub fn enabled(&self) -> bool {
        self.workers > 0 && !self.command.is_empty()
    }

    /// Total compile attempts per call: `max_retries + 1`, clamped at one
    /// and saturating at the integer maximum.
    pub fn attempts(&self) -> u64 {
        self.max_retries.saturating_add(1).max(1)
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u64) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable verbose error diagnostics.
    pub fn with_verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    /// Enable or disable config forwarding.
    pub fn with_inherit_config(mut self, inherit: bool) -> Self {
        self.inherit_config = inherit;
        self
    }

    /// Set the per-worker restart threshold (0 = never).
    pub fn with_reset_after(mut self, reset_after: u64) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Set the serialized host settings forwarded to workers.
    pub fn with_bound_config(mut self, json: impl Into<String>) -> Self {
        self.bound_config = json.into();
        self
    }

    /// Set the supplementary settings forwarded to workers.
    pub fn with_misc_config(mut self, json: impl Into<String>) -> Self {
        self.misc_config = json.into();
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `XCC_COMMAND`, `XCC_WORKERS`, `XCC_MAX_RETRIES`,
    /// `XCC_VERBOSE_ERRORS`, `XCC_INHERIT_CONFIG` and `XCC_RESET_AFTER`.
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(command) = std::env::var("XCC_COMMAND") {
            self.command = command;
        }
        if let Some(workers) = parse_env("XCC_WORKERS") {
            self.workers = workers;
        }
        if let Some(retries) = parse_env("XCC_MAX_RETRIES") {
            self.max_retries = retries;
        }
        if let Some(verbose) = parse_env_bool("XCC_VERBOSE_ERRORS") {
            self.verbose_errors = verbose;
        }
        if let Some(inherit) = parse_env_bool("XCC_INHERIT_CONFIG") {
            self.inherit_config = inherit;
        }
        if let Some(reset) = parse_env("XCC_RESET_AFTER") {
            self.reset_after = reset;
        }
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builds the supplementary config object sent as the second config frame.
///
/// Each field is wrapped as `{"key": {"global_value": <value>}}`, the shape
/// the compiler expects for settings that have no first-class binding.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    fields: serde_json::Map<String, Value>,
}

impl ConfigBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one setting.
    pub fn add_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(key.into(), json!({ "global_value": value.into() }));
        self
    }

    /// Serialize to a JSON object string, or the empty string when no fields
    /// were added (an empty body skips the frame body entirely).
    pub fn build(self) -> String {
        if self.fields.is_empty() {
            String::new()
        } else {
            Value::Object(self.fields).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disabled() {
        let config = PoolConfig::default();
        assert!(!config.enabled());
        assert_eq!(config.workers, 0);
        assert!(config.command.is_empty());
        assert!(config.inherit_config);
    }

    #[test]
    fn test_new_is_enabled() {
        let config = PoolConfig::new("compiler --daemon");
        assert!(config.enabled());
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn test_zero_workers_disables() {
        let config = PoolConfig::new("compiler").with_workers(0);
        assert!(!config.enabled());
    }

    #[test]
    fn test_attempts_clamps_and_saturates() {
        assert_eq!(PoolConfig::default().with_max_retries(0).attempts(), 1);
        assert_eq!(PoolConfig::default().with_max_retries(2).attempts(), 3);
        assert_eq!(
            PoolConfig::default().with_max_retries(u64::MAX).attempts(),
            u64::MAX
        );
    }

    #[test]
    fn test_config_builder_shape() {
        let out = ConfigBuilder::new()
            .add_field("include_roots", json!({"/": "/var/www"}))
            .build();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["include_roots"]["global_value"]["/"], "/var/www");
    }

    #[test]
    fn test_config_builder_empty() {
        assert_eq!(ConfigBuilder::new().build(), "");
    }
}
