//! Publishes completion re-entries for finalized chain transactions.

use std::sync::Arc;
use std::time::Duration;

use chainsaga_broker::{Broker, BrokerMessage};
use chainsaga_executor::codes::{self, TRANSACTION_REVERTED};
use chainsaga_executor::{ChainStrategy, ExecutorError, MessageStatus, StepMessage, TxStatus};
use chainsaga_store::{PendingOperation, PendingOperationTracker};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::WorkerError;

/// Polls the pending operations of one chain.
pub struct Finalizer {
  chain: Arc<dyn ChainStrategy>,
  tracker: Arc<dyn PendingOperationTracker>,
  broker: Arc<dyn Broker>,
  batch_size: i64,
  interval: Duration,
}

impl Finalizer {
  pub fn new(
    chain: Arc<dyn ChainStrategy>,
    tracker: Arc<dyn PendingOperationTracker>,
    broker: Arc<dyn Broker>,
  ) -> Self {
    Self {
      chain,
      tracker,
      broker,
      batch_size: 50,
      interval: Duration::from_secs(5),
    }
  }

  pub fn with_batch_size(mut self, batch_size: i64) -> Self {
    self.batch_size = batch_size;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Resolve one batch of operations, oldest first. Returns how many were
  /// removed.
  ///
  /// Operations still pending, or whose status lookup failed, are kept for
  /// the next pass.
  #[instrument(name = "finalize", skip_all, fields(chain_id = self.chain.chain_id()))]
  pub async fn run_once(&self) -> Result<usize, WorkerError> {
    let operations = self
      .tracker
      .list_operations(self.chain.chain_id(), self.batch_size)
      .await?;

    let mut finalized = 0;
    for operation in operations {
      let status = match self.chain.transaction_status(&operation).await {
        Ok(status) => status,
        Err(e) => {
          warn!(
            transaction_uuid = %operation.transaction_uuid,
            error = %e,
            "transaction_status_failed"
          );
          continue;
        }
      };

      let (status, response) = match status {
        TxStatus::Pending => continue,
        TxStatus::Confirmed(response) => (MessageStatus::Done, response),
        TxStatus::Reverted(details) => {
          let mut response = codes::failure(TRANSACTION_REVERTED, "transaction reverted");
          response["details"] = details;
          (MessageStatus::Failed, response)
        }
      };

      match reentry(&operation, status, response) {
        Ok(message) => {
          self.broker.publish(message).await?;
          info!(
            transaction_uuid = %operation.transaction_uuid,
            tx_hash = operation.tx_hash.as_deref(),
            ?status,
            "transaction_finalized"
          );
        }
        Err(e) => error!(
          transaction_uuid = %operation.transaction_uuid,
          error = %e,
          "pending_operation_malformed"
        ),
      }

      self.tracker.remove(&operation.transaction_uuid).await?;
      finalized += 1;
    }

    Ok(finalized)
  }

  /// Call [`run_once`](Self::run_once) every interval until cancelled.
  pub async fn run(&self, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = ticker.tick() => match self.run_once().await {
          Ok(0) => {}
          Ok(finalized) => debug!(finalized, "finalizer_pass"),
          Err(e) => error!(error = %e, "finalizer_pass_failed"),
        },
      }
    }
  }
}

/// Fill the stored re-entry template with the final status and response.
fn reentry(
  operation: &PendingOperation,
  status: MessageStatus,
  response: serde_json::Value,
) -> Result<BrokerMessage, ExecutorError> {
  let template: BrokerMessage = serde_json::from_value(operation.after_completion.0.clone())?;
  let step = StepMessage::from_broker(&template)?;
  Ok(BrokerMessage::new(
    template.topic,
    serde_json::to_value(step.reentry(status, response))?,
  ))
}
