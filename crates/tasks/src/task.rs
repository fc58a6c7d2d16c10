//! Task descriptor.
//!
//! A [`Task`] is everything needed to run one registered function later,
//! possibly in another process: the handler name, partition, priority,
//! expiry and kwargs. Cached tasks live in the session cache between send
//! and execution, and the queue message carries only a pointer to them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{self, SessionCache, DEFAULT_CACHE};
use crate::engine::Engine;
use crate::error::{CacheError, EngineError};
use crate::group::TaskGroup;
use crate::job::Job;
use crate::priority::{Priority, QueueTier};

/// Key prefix for sessions that don't belong to a job.
pub const TASK_CACHE_PREFIX: &str = "task";

/// Default lifetime of a task. Long-running jobs renew themselves.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Reserved kwarg carrying positional args of uncached tasks.
pub const ARGS_KWARG: &str = "_args";

/// Random session token, `t` plus 12 hex characters.
pub fn new_key() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("t{}", &id[..12])
}

/// Pointer to a cached session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRef {
    pub cache_name: String,
    pub task_key: String,
}

/// Queue message body: a cache pointer, or the kwargs themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Cached { cached_task: CacheRef },
    Inline(Map<String, Value>),
}

/// What a consumer needs to delete a received message later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub tier: QueueTier,
    pub receipt_handle: String,
}

/// Cache-resident record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Session {
    Task(Task),
    Job(Job),
}

impl Session {
    pub fn task(&self) -> &Task {
        match self {
            Session::Task(task) => task,
            Session::Job(job) => &job.task,
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Session::Job(job) => Some(job),
            Session::Task(_) => None,
        }
    }
}

/// Something that can be sent: a task or a job.
pub trait Schedulable {
    fn task(&self) -> &Task;

    fn to_session(&self) -> Session;

    /// How long the cached session lives.
    fn session_ttl(&self, _engine: &Engine) -> Duration {
        self.task().ttl()
    }
}

/// Construction options for [`Task::new`].
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Falls back to the owning job's priority, then to `MS`.
    pub priority: Option<Priority>,
    /// `None` sends kwargs inline in the message.
    pub cache: Option<String>,
    /// Absolute expiry; defaults to one hour from creation.
    pub expires: Option<DateTime<Utc>>,
    pub kwargs: Map<String, Value>,
    pub args: Vec<Value>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: None,
            cache: Some(DEFAULT_CACHE.to_string()),
            expires: None,
            kwargs: Map::new(),
            args: Vec::new(),
        }
    }
}

impl TaskOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires = Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: String,
    pub handler: String,
    /// Partition key, fixed at construction.
    pub group: String,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub expired: bool,
    pub cache_name: Option<String>,
    /// Owning job, resolved through the cache.
    pub job: Option<CacheRef>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl Task {
    pub fn new(handler: impl Into<String>, group: impl Into<TaskGroup>, options: TaskOptions) -> Self {
        Self::build(handler.into(), group.into().partition_key(), None, options)
    }

    pub(crate) fn build(
        handler: String,
        group: String,
        job: Option<CacheRef>,
        options: TaskOptions,
    ) -> Self {
        let created = Utc::now();
        let mut expires = options
            .expires
            .unwrap_or_else(|| created + chrono::Duration::seconds(DEFAULT_EXPIRY.as_secs() as i64));
        if expires <= created {
            warn!(handler = %handler, %expires, "task expiry not in the future, clamping");
            expires = created + chrono::Duration::seconds(1);
        }

        let task = Self {
            key: new_key(),
            handler,
            group,
            priority: options.priority.unwrap_or_default(),
            created,
            expires,
            expired: false,
            cache_name: options.cache.filter(|c| !c.is_empty()),
            job,
            kwargs: options.kwargs,
            args: options.args,
        };
        debug!(task = %task.label(), "created task");
        task
    }

    /// Stand-in descriptor for work that arrived as inline kwargs.
    pub(crate) fn placeholder(handler: &str, priority: Priority, kwargs: Map<String, Value>) -> Self {
        let mut task = Self::build(
            handler.to_string(),
            TaskGroup::System.partition_key(),
            None,
            TaskOptions::default().uncached().priority(priority),
        );
        task.kwargs = kwargs;
        task
    }

    pub fn is_cached(&self) -> bool {
        self.cache_name.is_some()
    }

    /// `<prefix>_<key>`, where prefix is the owning job's session key or
    /// `task`. Empty for uncached tasks.
    pub fn cache_key(&self) -> String {
        if !self.is_cached() {
            return String::new();
        }
        let prefix = self
            .job
            .as_ref()
            .map(|j| j.task_key.as_str())
            .unwrap_or(TASK_CACHE_PREFIX);
        format!("{prefix}_{}", self.key)
    }

    pub fn cache_ref(&self) -> Option<CacheRef> {
        self.cache_name.as_ref().map(|name| CacheRef {
            cache_name: name.clone(),
            task_key: self.cache_key(),
        })
    }

    /// Session lifetime: expiry minus creation, at least one second.
    pub fn ttl(&self) -> Duration {
        (self.expires - self.created)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || now > self.expires
    }

    pub fn partition_key(&self) -> &str {
        &self.group
    }

    /// The cache this task's session lives in.
    pub fn cache<'e>(&self, engine: &'e Engine) -> Result<&'e dyn SessionCache, CacheError> {
        let name = self
            .cache_name
            .as_deref()
            .ok_or_else(|| CacheError::Unknown(format!("{} is uncached", self.label())))?;
        engine.cache(name)
    }

    /// Cache the session (if cached) and build the message body.
    pub async fn put_info(&self, engine: &Engine) -> Result<MessageBody, EngineError> {
        put_info(self, engine).await
    }

    pub fn label(&self) -> String {
        let key = if self.is_cached() {
            self.cache_key()
        } else {
            "nocache".to_string()
        };
        format!("{key}{}-{}_{}", self.priority, self.group, self.handler)
    }
}

impl Schedulable for Task {
    fn task(&self) -> &Task {
        self
    }

    fn to_session(&self) -> Session {
        Session::Task(self.clone())
    }
}

pub(crate) async fn put_info<S: Schedulable + ?Sized>(
    item: &S,
    engine: &Engine,
) -> Result<MessageBody, EngineError> {
    let task = item.task();
    match task.cache_ref() {
        Some(cache_ref) => {
            let cache = engine.cache(&cache_ref.cache_name)?;
            cache::store_session(
                cache,
                &cache_ref.task_key,
                &item.to_session(),
                item.session_ttl(engine),
            )
            .await?;
            Ok(MessageBody::Cached {
                cached_task: cache_ref,
            })
        }
        None => {
            let mut kwargs = task.kwargs.clone();
            if !task.args.is_empty() {
                kwargs.insert(ARGS_KWARG.to_string(), Value::Array(task.args.clone()));
            }
            Ok(MessageBody::Inline(kwargs))
        }
    }
}
