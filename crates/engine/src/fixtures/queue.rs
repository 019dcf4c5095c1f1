//! Message queue adapter
//!
//! Speaks the SQS JSON protocol (ElasticMQ and compatible emulators). Queue
//! names used by steps are logical; the environment tag is appended before
//! any call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::error::{AccordError, AccordResult};
use crate::http::Headers;

pub const CONTENT_TYPE_ATTRIBUTE: &str = "contentType";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Largest batch a single receive call may return
pub const MAX_RECEIVE_BATCH: usize = 10;

const DEAD_LETTER_MARKER: &str = "dead";

/// A received message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub payload: String,
    pub headers: BTreeMap<String, String>,
}

impl QueueMessage {
    /// Payload and headers as one JSON object, for comparisons
    pub fn to_json(&self) -> Value {
        let payload = serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| Value::String(self.payload.clone()));
        json!({ "payload": payload, "headers": self.headers })
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Sends a JSON body; `headers` become string message attributes
    async fn send(
        &self,
        queue: &str,
        group_id: Option<&str>,
        body: &str,
        headers: &Headers,
    ) -> AccordResult<()>;

    async fn purge(&self, queue: &str) -> AccordResult<()>;

    /// Purges every active queue of this environment
    async fn purge_all(&self) -> AccordResult<()>;

    /// Visible, delayed and in-flight messages on one queue
    async fn pending_count(&self, queue: &str) -> AccordResult<u64>;

    /// Pending count for every active queue of this environment
    async fn pending_counts(&self) -> AccordResult<Vec<(String, u64)>>;

    async fn receive_up_to(&self, queue: &str, max: usize) -> AccordResult<Vec<QueueMessage>>;
}

/// Physical queue name: `orders` becomes `orders-local`, `orders.fifo`
/// becomes `orders-local.fifo`
pub fn qualified_queue_name(queue: &str, environment: &str) -> String {
    match queue.strip_suffix(".fifo") {
        Some(base) => format!("{}-{}.fifo", base, environment),
        None => format!("{}-{}", queue, environment),
    }
}

pub fn is_fifo(queue: &str) -> bool {
    queue.ends_with(".fifo")
}

/// SQS-compatible queue client
pub struct SqsQueue {
    http: reqwest::Client,
    endpoint: EndpointConfig,
}

impl SqsQueue {
    pub fn new(endpoint: EndpointConfig) -> AccordResult<Self> {
        info!(
            "Queue endpoint {} (region {}, environment {})",
            endpoint.endpoint_url, endpoint.region, endpoint.environment
        );
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            endpoint,
        })
    }

    fn qualified(&self, queue: &str) -> String {
        qualified_queue_name(queue, &self.endpoint.environment)
    }

    async fn call(&self, action: &str, payload: Value) -> AccordResult<Value> {
        debug!("SQS {} {}", action, payload);
        let resp = self
            .http
            .post(&self.endpoint.endpoint_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-amz-json-1.0")
            .header("X-Amz-Target", format!("AmazonSQS.{}", action))
            .body(payload.to_string())
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(AccordError::Queue(format!(
                "{} failed with {}: {}",
                action, status, text
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn queue_url(&self, queue: &str) -> AccordResult<String> {
        let name = self.qualified(queue);
        let resp = self.call("GetQueueUrl", json!({ "QueueName": name })).await?;
        resp.get("QueueUrl")
            .and_then(Value::as_str)
            .map(|url| self.endpoint.rewrite_url(url))
            .ok_or_else(|| AccordError::Queue(format!("No url returned for queue {}", name)))
    }

    /// Queue urls of this environment, dead-letter queues excluded
    async fn active_queue_urls(&self) -> AccordResult<Vec<String>> {
        let resp = self.call("ListQueues", json!({})).await?;
        let suffix = format!("-{}", self.endpoint.environment);
        let urls = resp
            .get("QueueUrls")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .filter(|url| {
                        let name = queue_name_from_url(url);
                        !name.contains(DEAD_LETTER_MARKER)
                            && name.trim_end_matches(".fifo").ends_with(&suffix)
                    })
                    .map(|url| self.endpoint.rewrite_url(url))
                    .collect()
            })
            .unwrap_or_default();
        Ok(urls)
    }

    async fn pending_for_url(&self, url: &str) -> AccordResult<u64> {
        let resp = self
            .call(
                "GetQueueAttributes",
                json!({
                    "QueueUrl": url,
                    "AttributeNames": [
                        "ApproximateNumberOfMessages",
                        "ApproximateNumberOfMessagesDelayed",
                        "ApproximateNumberOfMessagesNotVisible"
                    ]
                }),
            )
            .await?;

        let attributes = resp.get("Attributes").and_then(Value::as_object);
        let count = |name: &str| -> u64 {
            attributes
                .and_then(|a| a.get(name))
                .and_then(|v| match v {
                    Value::String(s) => s.parse().ok(),
                    other => other.as_u64(),
                })
                .unwrap_or(0)
        };
        Ok(count("ApproximateNumberOfMessages")
            + count("ApproximateNumberOfMessagesDelayed")
            + count("ApproximateNumberOfMessagesNotVisible"))
    }

    async fn purge_url(&self, url: &str) -> AccordResult<()> {
        self.call("PurgeQueue", json!({ "QueueUrl": url })).await?;
        debug!("Purged {}", url);
        Ok(())
    }
}

fn queue_name_from_url(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

fn string_attribute(value: &str) -> Value {
    json!({ "DataType": "String", "StringValue": value })
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn send(
        &self,
        queue: &str,
        group_id: Option<&str>,
        body: &str,
        headers: &Headers,
    ) -> AccordResult<()> {
        if is_fifo(queue) && group_id.is_none() {
            return Err(AccordError::InvalidConfig(format!(
                "FIFO queue {} needs a message group id",
                queue
            )));
        }

        let url = self.queue_url(queue).await?;
        let mut attributes = Map::new();
        attributes.insert(
            CONTENT_TYPE_ATTRIBUTE.to_string(),
            string_attribute(JSON_CONTENT_TYPE),
        );
        for (name, value) in headers {
            attributes.insert(name.clone(), string_attribute(value));
        }

        let mut request = json!({
            "QueueUrl": url,
            "MessageBody": body,
            "MessageAttributes": attributes,
        });
        if let Some(group_id) = group_id {
            request["MessageGroupId"] = json!(group_id);
            request["MessageDeduplicationId"] = json!(Uuid::new_v4().to_string());
        }

        self.call("SendMessage", request).await?;
        info!("Sent message to {}", self.qualified(queue));
        Ok(())
    }

    async fn purge(&self, queue: &str) -> AccordResult<()> {
        let url = self.queue_url(queue).await?;
        self.purge_url(&url).await
    }

    async fn purge_all(&self) -> AccordResult<()> {
        let urls = self.active_queue_urls().await?;
        for url in &urls {
            self.purge_url(url).await?;
        }
        info!("Purged {} queue(s)", urls.len());
        Ok(())
    }

    async fn pending_count(&self, queue: &str) -> AccordResult<u64> {
        let url = self.queue_url(queue).await?;
        self.pending_for_url(&url).await
    }

    async fn pending_counts(&self) -> AccordResult<Vec<(String, u64)>> {
        let mut counts = Vec::new();
        for url in self.active_queue_urls().await? {
            let pending = self.pending_for_url(&url).await?;
            counts.push((queue_name_from_url(&url).to_string(), pending));
        }
        Ok(counts)
    }

    async fn receive_up_to(&self, queue: &str, max: usize) -> AccordResult<Vec<QueueMessage>> {
        let url = self.queue_url(queue).await?;
        let mut messages = Vec::new();

        while messages.len() < max {
            let batch = (max - messages.len()).min(MAX_RECEIVE_BATCH);
            let resp = self
                .call(
                    "ReceiveMessage",
                    json!({
                        "QueueUrl": url,
                        "MaxNumberOfMessages": batch,
                        "MessageAttributeNames": ["All"],
                        "WaitTimeSeconds": 0
                    }),
                )
                .await?;

            let received: Vec<QueueMessage> = resp
                .get("Messages")
                .and_then(Value::as_array)
                .map(|list| list.iter().map(parse_message).collect())
                .unwrap_or_default();
            if received.is_empty() {
                break;
            }
            messages.extend(received);
        }

        debug!("Received {} message(s) from {}", messages.len(), url);
        Ok(messages)
    }
}

fn parse_message(message: &Value) -> QueueMessage {
    let payload = message
        .get("Body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let headers = message
        .get("MessageAttributes")
        .and_then(Value::as_object)
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(name, attribute)| {
                    attribute
                        .get("StringValue")
                        .and_then(Value::as_str)
                        .map(|value| (name.clone(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    QueueMessage { payload, headers }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_queue_name() {
        assert_eq!(qualified_queue_name("events", "local"), "events-local");
        assert_eq!(
            qualified_queue_name("orders.fifo", "ci"),
            "orders-ci.fifo"
        );
    }

    #[test]
    fn test_queue_name_from_url() {
        assert_eq!(
            queue_name_from_url("http://localhost:9324/000000000000/events-local"),
            "events-local"
        );
    }

    #[test]
    fn test_parse_message() {
        let raw = json!({
            "MessageId": "1",
            "Body": "{\"k\":1}",
            "MessageAttributes": {
                "contentType": {"DataType": "String", "StringValue": "application/json"},
                "tenant": {"DataType": "String", "StringValue": "acme"}
            }
        });
        let message = parse_message(&raw);
        assert_eq!(message.headers["tenant"], "acme");
        assert_eq!(message.to_json()["payload"], json!({"k": 1}));
    }
}
