use chainsaga_broker::BrokerError;
use chainsaga_executor::ExecutorError;
use chainsaga_store::StoreError;

/// Errors that stop a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  /// The registration row's params do not deserialize.
  #[error("invalid params for worker {worker_id}: {source}")]
  InvalidParams {
    worker_id: i64,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid worker configuration: {0}")]
  InvalidConfig(String),

  /// Too many tasks exceeded the zombie timeout at once.
  #[error("{stalled} tasks stalled, more than the allowed {max}")]
  ZombieCeiling { stalled: usize, max: usize },

  /// The registration row could not be released before exit.
  #[error("failed to release worker {worker_id}: {source}")]
  Release {
    worker_id: i64,
    #[source]
    source: StoreError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Broker(#[from] BrokerError),

  #[error(transparent)]
  Executor(#[from] ExecutorError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}
