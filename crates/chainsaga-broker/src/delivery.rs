use std::fmt;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;

use crate::{BrokerError, BrokerMessage};

/// Broker-specific acknowledgement of one delivery.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
  async fn ack(&self) -> Result<(), BrokerError>;

  /// The delivery was dropped without an ack.
  fn abandon(&self);
}

/// One message handed to a subscriber.
///
/// Holds one of the subscription's prefetch slots until it is acked or
/// dropped. Dropping without [`Delivery::ack`] hands the message back to the
/// broker for redelivery.
pub struct Delivery {
  message: BrokerMessage,
  attempt: u32,
  acker: Option<Box<dyn Acknowledger>>,
  _permit: OwnedSemaphorePermit,
}

impl Delivery {
  pub(crate) fn new(
    message: BrokerMessage,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
    permit: OwnedSemaphorePermit,
  ) -> Self {
    Self {
      message,
      attempt,
      acker: Some(acker),
      _permit: permit,
    }
  }

  pub fn message(&self) -> &BrokerMessage {
    &self.message
  }

  /// 1 on first delivery, incremented on each redelivery.
  pub fn attempt(&self) -> u32 {
    self.attempt
  }

  /// Remove the message from the broker and free the prefetch slot.
  pub async fn ack(mut self) -> Result<(), BrokerError> {
    if let Some(acker) = self.acker.take() {
      acker.ack().await?;
    }
    Ok(())
  }
}

impl Drop for Delivery {
  fn drop(&mut self) {
    if let Some(acker) = self.acker.take() {
      acker.abandon();
    }
  }
}

impl fmt::Debug for Delivery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Delivery")
      .field("message", &self.message)
      .field("attempt", &self.attempt)
      .field("acked", &self.acker.is_none())
      .finish()
  }
}
