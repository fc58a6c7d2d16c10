use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Process-level settings read from the environment.
///
/// Engine topology (queues, pollers, spool tuning) lives in the TOML
/// `EngineConfig` of `drover-tasks`; this struct carries the deployment
/// knobs and credentials that differ per host or profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub aws: AwsConfig,
    pub messaging: MessagingConfig,
    pub spool: SpoolEnvConfig,
    pub cache: CacheEnvConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "SQS_QUEUE_PREFIX",
    "REDIS_URL",
    "SPOOL_DIR",
];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DROVER_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DROVER_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            aws: AwsConfig::from_env_profiled(p),
            messaging: MessagingConfig::from_env_profiled(p),
            spool: SpoolEnvConfig::from_env_profiled(p),
            cache: CacheEnvConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  aws:         region={}, credentials={}",
            self.aws.region,
            if self.aws.has_static_credentials() { "static" } else { "default chain" }
        );
        tracing::info!(
            "  messaging:   distributed={}, prefix={}, version={}",
            self.messaging.distributed,
            self.messaging.queue_prefix,
            self.messaging.version
        );
        tracing::info!("  spool:       dir={}", self.spool.dir.display());
        tracing::info!(
            "  cache:       backend={}",
            if self.cache.redis_url.is_some() { "redis" } else { "memory" }
        );
    }

    /// Return a redacted view safe for diagnostics (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "aws": {
                "region": self.aws.region,
                "endpoint_url": self.aws.endpoint_url,
                "static_credentials": self.aws.has_static_credentials(),
            },
            "messaging": {
                "distributed": self.messaging.distributed,
                "queue_prefix": self.messaging.queue_prefix,
                "version": self.messaging.version,
            },
            "spool": { "dir": self.spool.dir },
            "cache": { "redis": self.cache.redis_url.is_some() },
        })
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Messaging ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// False runs every task inline in this process (single-node mode).
    pub distributed: bool,
    /// Queue names resolve as `{queue_prefix}_{TIER}.fifo`.
    pub queue_prefix: String,
    /// Protocol version stamped on every message; pollers skip mismatches.
    pub version: String,
}

impl MessagingConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            distributed: profiled_env_bool(p, "DROVER_DISTRIBUTED", false),
            queue_prefix: profiled_env_or(p, "SQS_QUEUE_PREFIX", "drover"),
            version: profiled_env_or(p, "MESSAGE_VERSION", "1"),
        }
    }
}

// ── Spool ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEnvConfig {
    pub dir: PathBuf,
}

impl SpoolEnvConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            dir: PathBuf::from(profiled_env_or(p, "SPOOL_DIR", "data/spool")),
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvConfig {
    /// Shared cache endpoint; `None` keeps sessions in process memory.
    pub redis_url: Option<String>,
}

impl CacheEnvConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            redis_url: profiled_env_opt(p, "REDIS_URL"),
        }
    }
}
