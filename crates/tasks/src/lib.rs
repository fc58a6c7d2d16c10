pub mod bot;
pub mod cache;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod group;
pub mod job;
pub mod output;
pub mod poller;
pub mod priority;
pub mod registry;
pub mod shutdown;
pub mod spooler;
pub mod task;
pub mod worker;

pub use bot::{bot_next, bot_start, bot_state, bot_stop, BotRegistry, BotSpec};
pub use cache::{MemoryCache, SessionCache, DEFAULT_CACHE};
pub use config::{EngineConfig, PollerSettings, QueueSettings, SpoolSection};
pub use context::{TaskContext, TaskOutcome};
pub use engine::{Dispatch, Engine, EngineBuilder, Sent};
pub use error::{
    AccumulateError, CacheError, ConfigError, DispatchError, EngineError, RegistryError,
    SpoolError, TaskError,
};
pub use group::{Partitioned, TaskGroup};
pub use job::{Job, JobCheck, JobOptions, JobPollConfig, JOB_DONE};
pub use output::{accumulate, get_output, output_key};
pub use poller::{run_poller, Received};
pub use priority::{DeleteTiming, ExecutionMode, Priority, QueueTier};
pub use registry::{Registry, TaskFn};
pub use shutdown::Shutdown;
pub use spooler::{run_spooler, Spooler, SpoolRecord};
pub use task::{MessageBody, Schedulable, Session, Task, TaskOptions};
pub use worker::run_worker;
