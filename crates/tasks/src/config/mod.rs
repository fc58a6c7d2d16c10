mod loading;
mod types;
mod validation;


pub use types::{EngineConfig, EngineSection, PollerSettings, QueueSettings, SpoolSection};
