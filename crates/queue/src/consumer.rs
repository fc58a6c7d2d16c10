//! Queue port and the message shapes that cross it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// One delivery of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    /// Valid for this delivery only; a redelivery carries a new one.
    pub receipt_handle: String,
    pub timestamp: DateTime<Utc>,
    /// 1 on first delivery.
    pub attempt_count: u32,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// FIFO message group.
    pub group_id: Option<String>,
}

impl QueueMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A message about to be sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: String,
    pub attributes: HashMap<String, String>,
    /// Only one message per group is in flight at a time.
    pub group_id: Option<String>,
    /// Sends with a deduplication id already seen inside the provider's
    /// window are accepted but not delivered twice.
    pub deduplication_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn deduplication(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }
}

/// Receive parameters for one long-poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: u32,
    /// Long-poll wait; zero returns immediately.
    pub wait_time: Duration,
    /// How long received messages stay hidden from other consumers.
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    pub approximate_message_count: Option<u64>,
    /// `sqs` or `memory`.
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.approximate_message_count {
            Some(count) => write!(f, "{} ({} messages", self.provider, count)?,
            None => write!(f, "{} (depth unknown", self.provider)?,
        }
        if self.connected {
            f.write_str(")")
        } else {
            f.write_str(", unreachable)")
        }
    }
}

/// An at-least-once FIFO queue.
///
/// A received message stays hidden for its visibility timeout. Unless it is
/// acked within that time it is delivered again, to this consumer or another.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the provider message id. A duplicate send inside the
    /// deduplication window returns the original id.
    async fn send(&self, message: OutboundMessage) -> Result<String, QueueError>;

    /// Receive up to `options.max_messages`, waiting at most
    /// `options.wait_time` for the first one.
    async fn poll_batch(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a received message.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Make a received message visible again right away.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_survive_serde() {
        let mut attributes = HashMap::new();
        attributes.insert("mpHandler".to_string(), "reports.rollup".to_string());
        let received = QueueMessage {
            id: "m-1".to_string(),
            body: r#"{"cached_task":{"cache_name":"session","task_key":"task_t1"}}"#.to_string(),
            receipt_handle: "r-1".to_string(),
            timestamp: Utc::now(),
            attempt_count: 2,
            attributes,
            group_id: Some("DEFAULT_acct-1".to_string()),
        };

        let back: QueueMessage =
            serde_json::from_str(&serde_json::to_string(&received).unwrap()).unwrap();
        assert_eq!(back.attribute("mpHandler"), Some("reports.rollup"));
        assert_eq!(back.attribute("mpPriority"), None);
        assert_eq!(back.group_id.as_deref(), Some("DEFAULT_acct-1"));
        assert_eq!(back.attempt_count, 2);
    }

    #[test]
    fn health_summary() {
        let mut health = QueueHealth {
            connected: true,
            approximate_message_count: Some(42),
            provider: "sqs".to_string(),
        };
        assert_eq!(health.to_string(), "sqs (42 messages)");
        health.connected = false;
        health.approximate_message_count = None;
        assert_eq!(health.to_string(), "sqs (depth unknown, unreachable)");
    }

    #[test]
    fn outbound_builder() {
        let msg = OutboundMessage::new("{}")
            .attribute("mpPriority", "MS")
            .group("DEFAULT_SYSTEM")
            .deduplication("t123");
        assert_eq!(msg.attributes["mpPriority"], "MS");
        assert_eq!(msg.group_id.as_deref(), Some("DEFAULT_SYSTEM"));
        assert_eq!(msg.deduplication_id.as_deref(), Some("t123"));
    }
}
