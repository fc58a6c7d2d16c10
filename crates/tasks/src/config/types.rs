use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use drover_queue::{QueueTarget, ReceiveOptions};

use crate::cache::DEFAULT_CACHE;
use crate::job::JobPollConfig;
use crate::priority::QueueTier;

// ── Top-level config ────────────────────────────────────────────────

/// Engine topology and tuning.
///
/// Parsed from `drover.toml` with `DROVER_*` environment overrides. Fields
/// left unset in the file (`distributed`, `version`, `queue_prefix`,
/// `spool.dir`) are filled from the deployment profile by
/// [`EngineConfig::with_deployment`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub spool: SpoolSection,

    /// Durable queue per tier.
    #[serde(default)]
    pub queues: BTreeMap<QueueTier, QueueSettings>,

    /// Named poll loops, each covering one or more queues.
    #[serde(default)]
    pub pollers: BTreeMap<String, PollerSettings>,
}

// ── Section configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Send through durable queues. Off runs everything in this process.
    pub distributed: Option<bool>,

    /// Message protocol version; pollers release messages of other versions.
    pub version: Option<String>,

    /// Queue names default to `<queue_prefix>_<TIER>.fifo`.
    pub queue_prefix: Option<String>,

    #[serde(default = "default_cache_name")]
    pub default_cache: String,

    #[serde(default = "default_job_poll_attempts")]
    pub job_poll_attempts: u32,

    #[serde(default = "default_job_poll_interval")]
    pub job_poll_interval_secs: f64,

    /// Extra session lifetime past a job's expiry.
    #[serde(default = "default_job_expiry_grace")]
    pub job_expiry_grace_secs: u64,
}

fn default_cache_name() -> String {
    DEFAULT_CACHE.into()
}

fn default_job_poll_attempts() -> u32 {
    10
}

fn default_job_poll_interval() -> f64 {
    1.0
}

fn default_job_expiry_grace() -> u64 {
    300
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            distributed: None,
            version: None,
            queue_prefix: None,
            default_cache: default_cache_name(),
            job_poll_attempts: default_job_poll_attempts(),
            job_poll_interval_secs: default_job_poll_interval(),
            job_expiry_grace_secs: default_job_expiry_grace(),
        }
    }
}

impl EngineSection {
    pub fn distributed(&self) -> bool {
        self.distributed.unwrap_or(false)
    }

    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or("1")
    }

    pub fn queue_prefix(&self) -> &str {
        self.queue_prefix.as_deref().unwrap_or("drover")
    }

    pub fn job_poll(&self) -> JobPollConfig {
        JobPollConfig {
            attempts: self.job_poll_attempts,
            interval: secs(self.job_poll_interval_secs),
        }
    }

    pub fn job_expiry_grace(&self) -> Duration {
        Duration::from_secs(self.job_expiry_grace_secs)
    }
}

/// Local spooler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolSection {
    pub dir: Option<PathBuf>,

    /// Drain even without an in-process wakeup, to pick up files written
    /// by other processes.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: f64,

    /// Pause after every spooled task.
    #[serde(default)]
    pub sleep_after_secs: f64,

    /// Pause taken by [`Engine::breathe`](crate::Engine::breathe).
    #[serde(default)]
    pub breathe_secs: f64,

    /// With a loop counter, breathe only every Nth iteration (0 = always).
    #[serde(default)]
    pub breathe_every: u64,
}

fn default_scan_interval() -> f64 {
    1.0
}

impl Default for SpoolSection {
    fn default() -> Self {
        Self {
            dir: None,
            scan_interval_secs: default_scan_interval(),
            sleep_after_secs: 0.0,
            breathe_secs: 0.0,
            breathe_every: 0,
        }
    }
}

impl SpoolSection {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("data/spool"))
    }

    pub fn scan_interval(&self) -> Duration {
        secs(self.scan_interval_secs)
    }

    pub fn sleep_after(&self) -> Duration {
        secs(self.sleep_after_secs)
    }

    pub fn breathe(&self) -> Duration {
        secs(self.breathe_secs)
    }
}

/// One durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Explicit queue URL; wins over `name`.
    pub url: Option<String>,

    /// Queue name resolved at connect time.
    pub name: Option<String>,

    #[serde(default = "default_long_poll")]
    pub long_poll_secs: u64,

    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_max_messages")]
    pub max_messages: u32,

    /// Skip polling while the spool backlog for this tier is at least this.
    #[serde(default = "default_full_threshold")]
    pub full_threshold: usize,

    /// Message group prefixes this process handles (empty = all).
    #[serde(default)]
    pub task_groups: Vec<String>,
}

fn default_long_poll() -> u64 {
    20
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_max_messages() -> u32 {
    1
}

fn default_full_threshold() -> usize {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: None,
            name: None,
            long_poll_secs: default_long_poll(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_messages: default_max_messages(),
            full_threshold: default_full_threshold(),
            task_groups: Vec::new(),
        }
    }
}

impl QueueSettings {
    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.max_messages,
            wait_time: Duration::from_secs(self.long_poll_secs),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
        }
    }

    pub fn target(&self, prefix: &str, tier: QueueTier) -> QueueTarget {
        match (&self.url, &self.name) {
            (Some(url), _) => QueueTarget::Url(url.clone()),
            (None, Some(name)) => QueueTarget::Name(name.clone()),
            (None, None) => QueueTarget::Name(format!("{prefix}_{tier}.fifo")),
        }
    }
}

/// A poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    /// Queues polled round-robin, in this order.
    pub queues: Vec<QueueTier>,

    /// Pause between rounds.
    #[serde(default = "default_freq")]
    pub freq_secs: f64,
}

fn default_freq() -> f64 {
    1.0
}

impl PollerSettings {
    pub fn freq(&self) -> Duration {
        secs(self.freq_secs)
    }
}

/// Seconds to a duration; validation rejects negative and non-finite values.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
