//! Bots: self-perpetuating tasks.
//!
//! A bot lives by sending its next task when the current one finishes.
//! There is no master process. A liveness token under the bot's name in the
//! shared cache decides which chain is real: every link carries the token it
//! was started with, and a link whose token no longer matches exits without
//! doing anything. Deleting the token stops the bot after the link that is
//! currently running.
//!
//! A bot's name is also its partition key, so at most one link of a bot is
//! in flight at a time.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::TaskContext;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::priority::Priority;
use crate::task::{new_key, Task, TaskOptions};

pub const BOT_KEY_KWARG: &str = "bot_key";
pub const BOT_STATE_KWARG: &str = "bot_state";

/// A bot definition.
#[derive(Debug, Clone, PartialEq)]
pub struct BotSpec {
    /// Unique across the process group; cache key and partition key.
    pub name: String,
    /// Registered task function that does one unit of work.
    pub handler: String,
    pub initial_state: Value,
    pub priority: Priority,
}

impl BotSpec {
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            initial_state: json!({}),
            priority: Priority::LowSpooled,
        }
    }

    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The task for one link of the chain.
    pub fn link_task(&self, token: &str, state: Value) -> Task {
        Task::new(
            self.handler.clone(),
            self.name.as_str(),
            TaskOptions::default()
                .priority(self.priority)
                .kwarg(BOT_KEY_KWARG, token)
                .kwarg(BOT_STATE_KWARG, state),
        )
    }
}

/// Start the bot unless a live chain already holds its token.
///
/// Returns the first link's task if this call won the start race.
pub async fn bot_start(engine: &Engine, spec: &BotSpec) -> Result<Option<Task>, EngineError> {
    let token = format!("{}{}", spec.name, new_key());
    let won = engine
        .default_cache()?
        .set_if_absent(&spec.name, Value::String(token.clone()), None)
        .await?;
    if !won {
        debug!(bot = %spec.name, "bot already running");
        return Ok(None);
    }

    info!(bot = %spec.name, state = %spec.initial_state, "bot start");
    let task = spec.link_task(&token, spec.initial_state.clone());
    engine.send(&task).await?;
    Ok(Some(task))
}

/// The state carried by this link, if its chain is still the live one.
pub async fn bot_state(ctx: &TaskContext) -> Result<Option<Value>, EngineError> {
    let name = ctx.task().partition_key();
    let carried = ctx.kwarg(BOT_KEY_KWARG).and_then(Value::as_str);
    let live = ctx.engine().default_cache()?.get(name).await?;

    match (live.as_ref().and_then(Value::as_str), carried) {
        (Some(live), Some(carried)) if live == carried => {
            Ok(Some(ctx.kwarg(BOT_STATE_KWARG).cloned().unwrap_or(Value::Null)))
        }
        _ => {
            info!(bot = %name, "bot will not continue");
            Ok(None)
        }
    }
}

/// Send the next link with the same token and the updated state.
pub async fn bot_next(ctx: &TaskContext, spec: &BotSpec, state: Value) -> Result<Task, EngineError> {
    let token = ctx
        .kwarg(BOT_KEY_KWARG)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let task = spec.link_task(token, state);
    ctx.engine().send(&task).await?;
    debug!(bot = %spec.name, "bot task queued");
    Ok(task)
}

/// Delete the token. The running link finishes; the next one exits.
pub async fn bot_stop(engine: &Engine, name: &str) -> Result<(), EngineError> {
    engine.default_cache()?.delete(name).await?;
    info!(bot = %name, "bot stopping");
    Ok(())
}

/// Bots every worker process starts at boot.
#[derive(Debug, Clone, Default)]
pub struct BotRegistry {
    bots: Vec<BotSpec>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: BotSpec) {
        self.bots.push(spec);
    }

    pub fn get(&self, name: &str) -> Option<&BotSpec> {
        self.bots.iter().find(|b| b.name == name)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    /// Start every bot not already running. Also restarts stopped bots.
    pub async fn start_all(&self, engine: &Engine) -> Result<usize, EngineError> {
        info!(count = self.bots.len(), "bots starting");
        let mut started = 0;
        for spec in &self.bots {
            if bot_start(engine, spec).await?.is_some() {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Admin suspension of every bot.
    pub async fn stop_all(&self, engine: &Engine) -> Result<(), EngineError> {
        info!(count = self.bots.len(), "bots stopping");
        for spec in &self.bots {
            bot_stop(engine, &spec.name).await?;
        }
        Ok(())
    }
}
