use super::types::EngineConfig;
use crate::error::ConfigError;

/// SQS receive batches are capped at 10.
const MAX_RECEIVE_BATCH: u32 = 10;

impl EngineConfig {
    /// Validate the config: poller references, queue limits, timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_poller_queues()?;
        self.validate_queue_limits()?;
        self.validate_timings()?;
        self.validate_job_grace()?;
        if self.engine.default_cache.is_empty() {
            return Err(ConfigError::Invalid("engine.default_cache is empty".into()));
        }
        Ok(())
    }

    /// Ensure every poller only names configured queues.
    fn validate_poller_queues(&self) -> Result<(), ConfigError> {
        for (name, poller) in &self.pollers {
            if poller.queues.is_empty() {
                return Err(ConfigError::Invalid(format!("poller '{name}' has no queues")));
            }
            for tier in &poller.queues {
                if !self.queues.contains_key(tier) {
                    return Err(ConfigError::Invalid(format!(
                        "poller '{name}' references unknown queue '{tier}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_queue_limits(&self) -> Result<(), ConfigError> {
        for (tier, queue) in &self.queues {
            if queue.max_messages == 0 || queue.max_messages > MAX_RECEIVE_BATCH {
                return Err(ConfigError::Invalid(format!(
                    "queue '{tier}' max_messages must be 1..={MAX_RECEIVE_BATCH}, got {}",
                    queue.max_messages
                )));
            }
            if queue.full_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue '{tier}' full_threshold must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// A job's completion check that is redelivered after the job expired
    /// must still find the session, so the grace has to cover a full
    /// visibility timeout.
    fn validate_job_grace(&self) -> Result<(), ConfigError> {
        let grace = self.engine.job_expiry_grace_secs;
        for (tier, queue) in &self.queues {
            if queue.visibility_timeout_secs > grace {
                return Err(ConfigError::Invalid(format!(
                    "queue '{tier}' visibility_timeout_secs ({}) exceeds engine.job_expiry_grace_secs ({grace})",
                    queue.visibility_timeout_secs
                )));
            }
        }
        Ok(())
    }

    fn validate_timings(&self) -> Result<(), ConfigError> {
        let timings = [
            ("engine.job_poll_interval_secs", self.engine.job_poll_interval_secs),
            ("spool.scan_interval_secs", self.spool.scan_interval_secs),
            ("spool.sleep_after_secs", self.spool.sleep_after_secs),
            ("spool.breathe_secs", self.spool.breathe_secs),
        ];
        let pollers = self
            .pollers
            .iter()
            .map(|(name, p)| (name.as_str(), p.freq_secs));

        for (name, value) in timings.into_iter().chain(pollers) {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        Ok(())
    }
}
