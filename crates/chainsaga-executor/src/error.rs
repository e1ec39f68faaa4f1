//! Executor errors.

use chainsaga_broker::BrokerError;
use chainsaga_graph::{GraphError, StepKind, WorkflowKind};
use chainsaga_store::StoreError;

/// Errors that escape the executor boundary.
///
/// Business failures never show up here; they are persisted as step
/// outcomes. Everything below is either a configuration mismatch or an
/// infrastructure fault.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// The message names a step kind the workflow's graph does not declare.
  #[error("unknown step '{step_kind}' for workflow kind '{workflow_kind}'")]
  UnknownStep {
    workflow_kind: WorkflowKind,
    step_kind: StepKind,
  },

  /// No executor is registered for the message topic.
  #[error("unsupported workflow topic '{topic}'")]
  UnsupportedWorkflow { topic: String },

  /// A workflow kind was registered twice with the dispatcher.
  #[error("workflow kind '{0}' is already registered")]
  DuplicateWorkflow(WorkflowKind),

  /// The factory built an executor for a different workflow kind.
  #[error("executor for '{actual}' registered under '{expected}'")]
  KindMismatch {
    expected: WorkflowKind,
    actual: WorkflowKind,
  },

  /// The message payload is not a step message.
  #[error("malformed step message: {0}")]
  MalformedMessage(#[source] serde_json::Error),

  /// No step row matches the message's dedup key.
  #[error("no step '{step_kind}' in workflow {workflow_id} under parent {parent_step_id:?}")]
  StepNotFound {
    workflow_id: String,
    step_kind: StepKind,
    parent_step_id: Option<String>,
  },

  /// A graph step names a handler that is not registered.
  #[error("no handler '{handler}' registered for step '{step_kind}' of '{workflow_kind}'")]
  MissingHandler {
    workflow_kind: WorkflowKind,
    step_kind: StepKind,
    handler: String,
  },

  /// The workflow's chain id has no registered strategy.
  #[error("no chain strategy registered for chain {chain_id}")]
  UnknownChain { chain_id: i64 },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Broker(#[from] BrokerError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
  /// Configuration errors cannot be fixed by redelivery.
  pub fn is_permanent(&self) -> bool {
    matches!(
      self,
      Self::UnknownStep { .. }
        | Self::UnsupportedWorkflow { .. }
        | Self::MalformedMessage(_)
        | Self::StepNotFound { .. }
        | Self::UnknownChain { .. }
    )
  }
}

/// Errors from chain strategies.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
  /// The RPC endpoint could not be reached or answered with an error.
  #[error("rpc error on chain {chain_id}: {message}")]
  Rpc { chain_id: i64, message: String },

  /// The stored transaction cannot be checked.
  #[error("invalid transaction {transaction_uuid}: {message}")]
  InvalidTransaction {
    transaction_uuid: String,
    message: String,
  },
}

/// Errors returned by step handlers.
///
/// The executor converts every handler error into a `failed` step outcome;
/// [`HandlerError::code`] is the error code recorded in the response.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
  /// The request params do not match what the handler expects.
  #[error("invalid request params: {0}")]
  InvalidParams(String),

  #[error(transparent)]
  Chain(#[from] ChainError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("{0}")]
  Other(String),
}

impl HandlerError {
  pub fn code(&self) -> &'static str {
    match self {
      Self::InvalidParams(_) => crate::codes::INVALID_PARAMS,
      Self::Chain(_) => crate::codes::CHAIN_ERROR,
      _ => crate::codes::INTERNAL_ERROR,
    }
  }
}
