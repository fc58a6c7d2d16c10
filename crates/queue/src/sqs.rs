//! AWS SQS FIFO queue implementation.
//!
//! FIFO queues are used for their message groups, not for ordering: the
//! group of an in-flight message is hidden from every other consumer until
//! the message is deleted or its visibility lapses. Content-based
//! deduplication must stay off on these queues, since bodies of uncached
//! tasks are plain kwargs and need not be unique.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use drover_core::config::AwsConfig;

use crate::consumer::{DurableQueue, OutboundMessage, QueueHealth, QueueMessage, ReceiveOptions};
use crate::error::QueueError;

/// SQS caps receive batches at 10 messages and long polls at 20 seconds.
const SQS_MAX_MESSAGES: u32 = 10;
const SQS_MAX_WAIT_SECS: u64 = 20;

/// Where an SQS queue lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTarget {
    /// Full queue URL.
    Url(String),
    /// Queue name, resolved with `GetQueueUrl` at connect time.
    Name(String),
}

/// SQS-backed durable queue.
pub struct SqsQueue {
    client: Client,
    name: String,
    queue_url: String,
}

impl SqsQueue {
    /// Build a client from project config and resolve the queue URL.
    pub async fn connect(aws: &AwsConfig, target: QueueTarget) -> Result<Self, QueueError> {
        let client = Self::build_client(aws).await;

        let (name, queue_url) = match target {
            QueueTarget::Url(url) => (queue_name_from_url(&url), url),
            QueueTarget::Name(name) => {
                let resp = client
                    .get_queue_url()
                    .queue_name(&name)
                    .send()
                    .await
                    .map_err(|e| QueueError::NotFound(format!("{name}: {e:?}")))?;
                let url = resp
                    .queue_url()
                    .ok_or_else(|| QueueError::NotFound(name.clone()))?
                    .to_string();
                (name, url)
            }
        };

        info!(
            queue = %name,
            queue_url = %queue_url,
            region = %aws.region,
            "SQS queue connected"
        );

        Ok(Self {
            client,
            name,
            queue_url,
        })
    }

    async fn build_client(aws: &AwsConfig) -> Client {
        let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

        // Static credentials build the SQS config directly. aws_config::defaults()
        // also reads AWS_ENDPOINT_URL, which may point at another service.
        let mut sqs_config = if aws.has_static_credentials() {
            let creds = Credentials::new(
                aws.access_key_id.clone().unwrap_or_default(),
                aws.secret_access_key.clone().unwrap_or_default(),
                aws.session_token.clone(),
                None,
                "drover-queue-static",
            );
            aws_sdk_sqs::Config::builder()
                .region(region)
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(creds)
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_sqs::config::Builder::from(&shared)
        };

        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        Client::from_conf(sqs_config.build())
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Change how long a received message stays hidden.
    pub async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout_secs: i32,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout_secs)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;
        Ok(())
    }
}

/// Extract the queue name from the queue URL.
///
/// `https://sqs.region.amazonaws.com/123456789/my-queue.fifo` → `my-queue.fifo`
fn queue_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .to_string()
}

#[async_trait]
impl DurableQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<String, QueueError> {
        let mut req = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message.body);

        if let Some(group) = message.group_id {
            req = req.message_group_id(group);
        }
        if let Some(dedup) = message.deduplication_id {
            req = req.message_deduplication_id(dedup);
        }
        for (key, value) in message.attributes {
            let attr = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| QueueError::Send(format!("attribute {key}: {e}")))?;
            req = req.message_attributes(key, attr);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| QueueError::Send(format!("SQS send failed: {e:?}")))?;

        let id = resp.message_id().unwrap_or("unknown").to_string();
        debug!(queue = %self.name, message_id = %id, "Sent SQS message");
        Ok(id)
    }

    async fn poll_batch(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        let capped = options.max_messages.clamp(1, SQS_MAX_MESSAGES) as i32;
        let wait = options.wait_time.as_secs().min(SQS_MAX_WAIT_SECS) as i32;

        debug!(queue = %self.name, max_messages = capped, wait, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(wait)
            .visibility_timeout(options.visibility_timeout.as_secs() as i32)
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(queue = %self.name, count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or("").to_string();

            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            let system = msg.attributes();

            // SentTimestamp is epoch millis.
            let timestamp = system
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = system
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            let group_id = system
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::MessageGroupId))
                .cloned();

            let attributes: HashMap<String, String> = msg
                .message_attributes()
                .map(|attrs| {
                    attrs
                        .iter()
                        .filter_map(|(k, v)| v.string_value().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            messages.push(QueueMessage {
                id,
                body,
                receipt_handle,
                timestamp,
                attempt_count,
                attributes,
                group_id,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(queue = %self.name, "Deleting SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(queue = %self.name, "Releasing SQS message (visibility=0)");
        self.change_visibility(receipt_handle, 0).await
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e:?}")))?;

        let count = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }
}
