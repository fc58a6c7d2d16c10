//! In-process FIFO queue with SQS semantics.
//!
//! Used by single-process deployments and tests. Mirrors the parts of SQS
//! FIFO behavior the task engine relies on: message groups with at most one
//! message in flight per group, visibility timeouts, receive counts, and a
//! five-minute deduplication window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::consumer::{DurableQueue, OutboundMessage, QueueHealth, QueueMessage, ReceiveOptions};
use crate::error::QueueError;

const DEDUP_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Stored {
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    group_id: Option<String>,
    sent: DateTime<Utc>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl Stored {
    fn in_flight(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<Stored>,
    /// Deduplication id -> (message id, first seen).
    dedup: HashMap<String, (String, Instant)>,
}

/// Memory-backed [`DurableQueue`].
pub struct MemoryQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|e| QueueError::Provider(format!("memory queue lock poisoned: {e}")))
    }

    /// Messages stored, visible or not.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently received and hidden from other consumers.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .map(|s| s.messages.iter().filter(|m| m.in_flight(now)).count())
            .unwrap_or(0)
    }

    /// Take whatever is receivable right now, or report when the next
    /// hidden message becomes visible again.
    fn take_visible(
        &self,
        options: &ReceiveOptions,
    ) -> Result<(Vec<QueueMessage>, Option<Instant>), QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let blocked: HashSet<String> = state
            .messages
            .iter()
            .filter(|m| m.in_flight(now))
            .filter_map(|m| m.group_id.clone())
            .collect();
        let next_visible = state
            .messages
            .iter()
            .filter_map(|m| m.invisible_until.filter(|until| *until > now))
            .min();

        let max = options.max_messages.max(1) as usize;
        let mut taken_groups = HashSet::new();
        let mut batch = Vec::new();

        for stored in state.messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if stored.in_flight(now) {
                continue;
            }
            if let Some(group) = &stored.group_id {
                if blocked.contains(group) || !taken_groups.insert(group.clone()) {
                    continue;
                }
            }

            let receipt = Uuid::new_v4().to_string();
            stored.receive_count += 1;
            stored.invisible_until = Some(now + options.visibility_timeout);
            stored.receipt = Some(receipt.clone());

            batch.push(QueueMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                receipt_handle: receipt,
                timestamp: stored.sent,
                attempt_count: stored.receive_count,
                attributes: stored.attributes.clone(),
                group_id: stored.group_id.clone(),
            });
        }

        Ok((batch, next_visible))
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<String, QueueError> {
        let now = Instant::now();
        let id = {
            let mut state = self.lock()?;
            state
                .dedup
                .retain(|_, (_, seen)| now.duration_since(*seen) < DEDUP_WINDOW);

            if let Some(dedup_id) = &message.deduplication_id {
                if let Some((existing, _)) = state.dedup.get(dedup_id) {
                    debug!(queue = %self.name, dedup_id = %dedup_id, "Duplicate send suppressed");
                    return Ok(existing.clone());
                }
            }

            let id = Uuid::new_v4().to_string();
            if let Some(dedup_id) = message.deduplication_id {
                state.dedup.insert(dedup_id, (id.clone(), now));
            }
            state.messages.push_back(Stored {
                id: id.clone(),
                body: message.body,
                attributes: message.attributes,
                group_id: message.group_id,
                sent: Utc::now(),
                receive_count: 0,
                invisible_until: None,
                receipt: None,
            });
            id
        };

        debug!(queue = %self.name, message_id = %id, "Queued message");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn poll_batch(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + options.wait_time;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self.take_visible(options)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let pos = state
                .messages
                .iter()
                .position(|m| m.receipt.as_deref() == Some(receipt_handle))
                .ok_or_else(|| QueueError::Ack(format!("unknown receipt {receipt_handle}")))?;
            state.messages.remove(pos);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let stored = state
                .messages
                .iter_mut()
                .find(|m| m.receipt.as_deref() == Some(receipt_handle))
                .ok_or_else(|| QueueError::Ack(format!("unknown receipt {receipt_handle}")))?;
            stored.invisible_until = None;
            stored.receipt = None;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let count = self.lock()?.messages.len() as u64;
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(count),
            provider: "memory".to_string(),
        })
    }
}
