use std::sync::Arc;

use chainsaga_graph::{StepKind, WorkflowKind};
use chainsaga_store::{Json, PendingOperation, PendingOperationTracker};
use chrono::Utc;
use tracing::info;

use crate::chain::ChainStrategy;
use crate::error::HandlerError;
use crate::message::{MessageStatus, StepMessage};

/// Everything a handler may know about the step it is executing.
///
/// Built fresh for each execution and dropped when the handler returns.
#[derive(Clone)]
pub struct StepContext {
  pub(crate) workflow_id: String,
  pub(crate) workflow_kind: WorkflowKind,
  pub(crate) client_id: i64,
  pub(crate) step_id: String,
  pub(crate) step_kind: StepKind,
  pub(crate) parent_step_id: Option<String>,
  pub(crate) retry_count: i32,
  pub(crate) chain: Arc<dyn ChainStrategy>,
  pub(crate) tracker: Arc<dyn PendingOperationTracker>,
}

impl StepContext {
  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  pub fn workflow_kind(&self) -> &WorkflowKind {
    &self.workflow_kind
  }

  pub fn client_id(&self) -> i64 {
    self.client_id
  }

  pub fn step_id(&self) -> &str {
    &self.step_id
  }

  pub fn step_kind(&self) -> &StepKind {
    &self.step_kind
  }

  pub fn retry_count(&self) -> i32 {
    self.retry_count
  }

  /// Strategy for the workflow's chain.
  pub fn chain(&self) -> &Arc<dyn ChainStrategy> {
    &self.chain
  }

  /// The message that completes this step once its transaction finalizes.
  ///
  /// The finalizer fills in the final status and response.
  pub fn reentry_message(&self) -> StepMessage {
    StepMessage {
      workflow_id: self.workflow_id.clone(),
      step_kind: self.step_kind.clone(),
      parent_step_id: self.parent_step_id.clone(),
      status: MessageStatus::Done,
      request_params: serde_json::Value::Null,
    }
  }

  /// Record a submitted chain transaction for the finalizer and return its
  /// tracking uuid.
  ///
  /// Handlers call this before returning [`StepOutcome::awaiting`] with the
  /// same hash.
  ///
  /// [`StepOutcome::awaiting`]: crate::StepOutcome::awaiting
  pub async fn track_transaction(
    &self,
    tx_hash: &str,
    raw_transaction: serde_json::Value,
  ) -> Result<String, HandlerError> {
    let transaction_uuid = uuid::Uuid::new_v4().to_string();
    let after_completion = self.reentry_message().to_broker(&self.workflow_kind).map_err(
      |e| HandlerError::Other(format!("cannot build completion message: {e}")),
    )?;

    let operation = PendingOperation {
      transaction_uuid: transaction_uuid.clone(),
      chain_id: self.chain.chain_id(),
      tx_hash: Some(tx_hash.to_string()),
      raw_transaction: Json(raw_transaction),
      after_completion: Json(serde_json::to_value(after_completion)?),
      created_at: Utc::now(),
    };
    self.tracker.record(&operation).await?;

    info!(
      workflow_id = %self.workflow_id,
      step_id = %self.step_id,
      tx_hash,
      transaction_uuid = %transaction_uuid,
      "transaction_tracked"
    );
    Ok(transaction_uuid)
  }
}
