use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::delivery::Acknowledger;
use crate::{Broker, BrokerError, BrokerMessage, Delivery, Subscription, topic_matches};

struct Queued {
  message: BrokerMessage,
  attempts: u32,
}

#[derive(Default)]
struct Inner {
  queue: Mutex<VecDeque<Queued>>,
  notify: Notify,
  closed: AtomicBool,
  acked: AtomicUsize,
}

impl Inner {
  fn queue(&self) -> MutexGuard<'_, VecDeque<Queued>> {
    self.queue.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn take(&self, topic: &str) -> Option<Queued> {
    let mut queue = self.queue();
    let position = queue
      .iter()
      .position(|queued| topic_matches(topic, &queued.message.topic))?;
    queue.remove(position)
  }
}

/// In-process broker.
///
/// Messages are delivered in publish order per matching subscriber. Dropped
/// deliveries go back to the front of the queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
  inner: Arc<Inner>,
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Messages published but not yet delivered.
  pub fn queued(&self) -> Vec<BrokerMessage> {
    self
      .inner
      .queue()
      .iter()
      .map(|queued| queued.message.clone())
      .collect()
  }

  /// Remove and return every undelivered message.
  pub fn drain_queued(&self) -> Vec<BrokerMessage> {
    self
      .inner
      .queue()
      .drain(..)
      .map(|queued| queued.message)
      .collect()
  }

  /// Number of deliveries acknowledged so far.
  pub fn acked(&self) -> usize {
    self.inner.acked.load(Ordering::SeqCst)
  }

  /// Stop handing out deliveries once the queue is empty.
  pub fn close(&self) {
    self.inner.closed.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
    if self.inner.closed.load(Ordering::SeqCst) {
      return Err(BrokerError::Closed);
    }
    debug!(topic = %message.topic, "message_published");
    self.inner.queue().push_back(Queued {
      message,
      attempts: 0,
    });
    self.inner.notify.notify_waiters();
    Ok(())
  }

  async fn subscribe(
    &self,
    topic: &str,
    prefetch: usize,
  ) -> Result<Box<dyn Subscription>, BrokerError> {
    if prefetch == 0 {
      return Err(BrokerError::ZeroPrefetch);
    }
    Ok(Box::new(MemorySubscription {
      inner: self.inner.clone(),
      topic: topic.to_string(),
      slots: Arc::new(Semaphore::new(prefetch)),
    }))
  }
}

struct MemorySubscription {
  inner: Arc<Inner>,
  topic: String,
  slots: Arc<Semaphore>,
}

#[async_trait]
impl Subscription for MemorySubscription {
  async fn next(&mut self) -> Result<Delivery, BrokerError> {
    let permit = self
      .slots
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| BrokerError::Closed)?;

    loop {
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(queued) = self.inner.take(&self.topic) {
        let attempts = queued.attempts + 1;
        let acker = MemoryAck {
          inner: self.inner.clone(),
          message: queued.message.clone(),
          attempts,
        };
        return Ok(Delivery::new(
          queued.message,
          attempts,
          Box::new(acker),
          permit,
        ));
      }

      if self.inner.closed.load(Ordering::SeqCst) {
        return Err(BrokerError::Closed);
      }

      notified.await;
    }
  }
}

struct MemoryAck {
  inner: Arc<Inner>,
  message: BrokerMessage,
  attempts: u32,
}

#[async_trait]
impl Acknowledger for MemoryAck {
  async fn ack(&self) -> Result<(), BrokerError> {
    self.inner.acked.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn abandon(&self) {
    debug!(topic = %self.message.topic, attempts = self.attempts, "message_requeued");
    self.inner.queue().push_front(Queued {
      message: self.message.clone(),
      attempts: self.attempts,
    });
    self.inner.notify.notify_waiters();
  }
}
