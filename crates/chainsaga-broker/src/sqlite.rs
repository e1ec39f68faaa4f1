use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::delivery::Acknowledger;
use crate::{Broker, BrokerError, BrokerMessage, Delivery, MessageBody, Subscription};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Durable broker over the `broker_messages` table.
///
/// A claimed message is hidden for the visibility timeout. Ack deletes the
/// row; an unacked message becomes visible again once the timeout expires.
#[derive(Clone)]
pub struct SqliteBroker {
  pool: SqlitePool,
  visibility_timeout: Duration,
  poll_interval: Duration,
}

impl SqliteBroker {
  /// Create a broker over a pool whose schema is already migrated.
  pub fn new(pool: SqlitePool) -> Self {
    Self {
      pool,
      visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
      poll_interval: DEFAULT_POLL_INTERVAL,
    }
  }

  pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
    self.visibility_timeout = timeout;
    self
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Number of messages not yet acked, visible or not.
  pub async fn depth(&self) -> Result<i64, BrokerError> {
    let depth = sqlx::query_scalar("SELECT COUNT(*) FROM broker_messages")
      .fetch_one(&self.pool)
      .await?;
    Ok(depth)
  }
}

#[async_trait]
impl Broker for SqliteBroker {
  async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
    let now = Utc::now();

    sqlx::query(
      r#"
            INSERT INTO broker_messages (topic, body, enqueued_at, visible_at)
            VALUES (?, ?, ?, ?)
            "#,
    )
    .bind(&message.topic)
    .bind(Json(&message.message))
    .bind(now)
    .bind(now.timestamp_millis())
    .execute(&self.pool)
    .await?;

    debug!(topic = %message.topic, "message_published");
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
    Ok(Box::new(SqliteSubscription {
      broker: self.clone(),
      topic: topic.to_string(),
      slots: Arc::new(Semaphore::new(prefetch)),
    }))
  }
}

struct SqliteSubscription {
  broker: SqliteBroker,
  topic: String,
  slots: Arc<Semaphore>,
}

impl SqliteSubscription {
  async fn claim(&self) -> Result<Option<(i64, String, MessageBody, u32)>, BrokerError> {
    let now = Utc::now().timestamp_millis();
    let hidden_until = now + self.broker.visibility_timeout.as_millis() as i64;
    let sub_topics = format!("{}.", self.topic);

    let claimed: Option<(i64, String, Json<MessageBody>, i64)> = sqlx::query_as(
      r#"
            UPDATE broker_messages
            SET visible_at = ?, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM broker_messages
                WHERE (topic = ? OR substr(topic, 1, ?) = ?) AND visible_at <= ?
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, topic, body, delivery_count
            "#,
    )
    .bind(hidden_until)
    .bind(&self.topic)
    .bind(sub_topics.len() as i64)
    .bind(&sub_topics)
    .bind(now)
    .fetch_optional(&self.broker.pool)
    .await?;

    Ok(claimed.map(|(id, topic, Json(body), count)| (id, topic, body, count as u32)))
  }
}

#[async_trait]
impl Subscription for SqliteSubscription {
  async fn next(&mut self) -> Result<Delivery, BrokerError> {
    let permit = self
      .slots
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| BrokerError::Closed)?;

    loop {
      if let Some((id, topic, body, attempts)) = self.claim().await? {
        if attempts > 1 {
          warn!(message_id = id, topic = %topic, attempts, "message_redelivered");
        }
        let acker = SqliteAck {
          pool: self.broker.pool.clone(),
          id,
        };
        let message = BrokerMessage {
          topic,
          message: body,
        };
        return Ok(Delivery::new(message, attempts, Box::new(acker), permit));
      }
      tokio::time::sleep(self.broker.poll_interval).await;
    }
  }
}

struct SqliteAck {
  pool: SqlitePool,
  id: i64,
}

#[async_trait]
impl Acknowledger for SqliteAck {
  async fn ack(&self) -> Result<(), BrokerError> {
    sqlx::query("DELETE FROM broker_messages WHERE id = ?")
      .bind(self.id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  fn abandon(&self) {
    // The row stays hidden until its visibility timeout expires.
    debug!(message_id = self.id, "message_abandoned");
  }
}
