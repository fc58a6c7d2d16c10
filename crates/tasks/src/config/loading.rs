use std::path::Path;

use drover_core::Config;

use crate::error::ConfigError;

use super::types::EngineConfig;

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-process config: no queues, no pollers, everything inline.
    pub fn local() -> Self {
        let mut config = Self::default();
        config.engine.distributed = Some(false);
        config
    }

    /// Fill settings the file left unset from the deployment profile.
    pub fn with_deployment(mut self, deployment: &Config) -> Self {
        let engine = &mut self.engine;
        engine
            .distributed
            .get_or_insert(deployment.messaging.distributed);
        engine
            .version
            .get_or_insert_with(|| deployment.messaging.version.clone());
        engine
            .queue_prefix
            .get_or_insert_with(|| deployment.messaging.queue_prefix.clone());
        self.spool
            .dir
            .get_or_insert_with(|| deployment.spool.dir.clone());
        self
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `DROVER_SECTION_KEY` overrides `section.key`.
    /// - `DROVER_ENGINE_DEFAULT_CACHE` -> `engine.default_cache`
    /// - `DROVER_ENGINE_JOB_POLL_ATTEMPTS` -> `engine.job_poll_attempts`
    /// - `DROVER_SPOOL_DIR` -> `spool.dir`
    /// - `DROVER_SPOOL_SLEEP_AFTER_SECS` -> `spool.sleep_after_secs`
    /// - `DROVER_SPOOL_BREATHE_SECS` -> `spool.breathe_secs`
    /// - `DROVER_SPOOL_BREATHE_EVERY` -> `spool.breathe_every`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DROVER_ENGINE_DEFAULT_CACHE") {
            self.engine.default_cache = v;
        }
        if let Ok(v) = std::env::var("DROVER_ENGINE_JOB_POLL_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.engine.job_poll_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("DROVER_SPOOL_DIR") {
            self.spool.dir = Some(v.into());
        }
        if let Ok(v) = std::env::var("DROVER_SPOOL_SLEEP_AFTER_SECS") {
            if let Ok(secs) = v.parse::<f64>() {
                self.spool.sleep_after_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DROVER_SPOOL_BREATHE_SECS") {
            if let Ok(secs) = v.parse::<f64>() {
                self.spool.breathe_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DROVER_SPOOL_BREATHE_EVERY") {
            if let Ok(n) = v.parse::<u64>() {
                self.spool.breathe_every = n;
            }
        }
    }
}
