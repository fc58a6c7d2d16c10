pub mod consumer;
pub mod error;
pub mod memory;
pub mod sqs;

pub use consumer::{
    DurableQueue, OutboundMessage, QueueHealth, QueueMessage, ReceiveOptions,
};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use sqs::{QueueTarget, SqsQueue};
