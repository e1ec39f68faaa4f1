//! Chainsaga Broker
//!
//! The message transport the worker runtime pulls from. A [`Broker`] accepts
//! published [`BrokerMessage`]s and hands out [`Subscription`]s over a topic
//! prefix. Each subscription holds at most `prefetch` unacknowledged
//! [`Delivery`] values; further deliveries are withheld until one is acked
//! or dropped.
//!
//! Two implementations are provided:
//! - [`MemoryBroker`]: in-process queue, dropped deliveries are requeued
//! - [`SqliteBroker`]: durable table with a visibility timeout

mod delivery;
mod error;
mod memory;
mod sqlite;

pub use delivery::Delivery;
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Envelope published to and consumed from the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
  pub topic: String,
  pub message: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
  pub payload: serde_json::Value,
}

impl BrokerMessage {
  pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      topic: topic.into(),
      message: MessageBody { payload },
    }
  }

  pub fn payload(&self) -> &serde_json::Value {
    &self.message.payload
  }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Broker: Send + Sync {
  async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError>;

  /// Subscribe to `topic` and every `topic.*` sub-topic.
  async fn subscribe(
    &self,
    topic: &str,
    prefetch: usize,
  ) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A consumer's view of the broker.
#[async_trait]
pub trait Subscription: Send {
  /// Wait for the next delivery.
  ///
  /// Does not return while `prefetch` deliveries from this subscription are
  /// still outstanding.
  async fn next(&mut self) -> Result<Delivery, BrokerError>;
}

/// True if `topic` is `prefix` itself or one of its dotted sub-topics.
pub fn topic_matches(prefix: &str, topic: &str) -> bool {
  match topic.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('.'),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_topic_matches() {
    assert!(topic_matches("workflow", "workflow"));
    assert!(topic_matches("workflow", "workflow.mint"));
    assert!(!topic_matches("workflow", "workflows.mint"));
    assert!(!topic_matches("workflow.mint", "workflow"));
  }

  #[test]
  fn test_message_shape() {
    let message = BrokerMessage::new("workflow.mint", serde_json::json!({ "stepKind": "init" }));
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["topic"], "workflow.mint");
    assert_eq!(value["message"]["payload"]["stepKind"], "init");
  }
}
