/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
  /// The broker was closed; no further deliveries will be made.
  #[error("broker closed")]
  Closed,

  /// Prefetch must allow at least one outstanding delivery.
  #[error("prefetch must be at least 1")]
  ZeroPrefetch,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}
