use std::time::Duration;

use chainsaga_broker::{Broker, BrokerMessage, SqliteBroker};
use chainsaga_store::SqliteStore;
use serde_json::json;

async fn broker() -> SqliteBroker {
  let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
  store.migrate().await.unwrap();
  SqliteBroker::new(store.pool().clone()).with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_ack_deletes_message() {
  let broker = broker().await;
  broker
    .publish(BrokerMessage::new("workflow.mint", json!({ "stepKind": "init" })))
    .await
    .unwrap();

  let mut sub = broker.subscribe("workflow", 1).await.unwrap();
  let delivery = sub.next().await.unwrap();
  assert_eq!(delivery.message().topic, "workflow.mint");
  assert_eq!(delivery.message().payload()["stepKind"], "init");
  assert_eq!(delivery.attempt(), 1);

  delivery.ack().await.unwrap();
  assert_eq!(broker.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sub_topic_matching() {
  let broker = broker().await;
  broker
    .publish(BrokerMessage::new("workflows.other", json!(1)))
    .await
    .unwrap();
  broker
    .publish(BrokerMessage::new("workflow.redeem", json!(2)))
    .await
    .unwrap();

  let mut sub = broker.subscribe("workflow", 1).await.unwrap();
  let delivery = sub.next().await.unwrap();
  assert_eq!(delivery.message().payload(), &json!(2));
}

#[tokio::test]
async fn test_unacked_message_reappears_after_visibility_timeout() {
  let broker = broker()
    .await
    .with_visibility_timeout(Duration::from_millis(50));
  broker
    .publish(BrokerMessage::new("workflow.mint", json!("again")))
    .await
    .unwrap();

  let mut sub = broker.subscribe("workflow", 2).await.unwrap();
  let first = sub.next().await.unwrap();
  drop(first);

  let second = tokio::time::timeout(Duration::from_secs(2), sub.next())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(second.attempt(), 2);
  assert_eq!(second.message().payload(), &json!("again"));
}

#[tokio::test]
async fn test_prefetch_withholds_delivery() {
  let broker = broker().await;
  for i in 0..2 {
    broker
      .publish(BrokerMessage::new("workflow.mint", json!(i)))
      .await
      .unwrap();
  }

  let mut sub = broker.subscribe("workflow", 1).await.unwrap();
  let first = sub.next().await.unwrap();
  let blocked = tokio::time::timeout(Duration::from_millis(100), sub.next()).await;
  assert!(blocked.is_err());

  first.ack().await.unwrap();
  let second = tokio::time::timeout(Duration::from_secs(1), sub.next())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(second.message().payload(), &json!(1));
}
