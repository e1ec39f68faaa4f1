use crate::types::{StepStatus, WorkflowStatus};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  /// A step with the same (workflow, kind, parent) key already exists.
  #[error("duplicate step '{kind}' for workflow {workflow_id} (parent {parent_id:?})")]
  DuplicateStep {
    workflow_id: String,
    kind: String,
    parent_id: Option<String>,
  },

  /// The step has already left the `queued` state.
  #[error("step {step_id} is already {status}")]
  AlreadyProcessing { step_id: String, status: StepStatus },

  /// A step transition was attempted from the wrong state.
  #[error("step {step_id} cannot move from {from} to {to}")]
  InvalidTransition {
    step_id: String,
    from: StepStatus,
    to: StepStatus,
  },

  /// A terminal workflow status conflicts with the one already recorded.
  #[error("workflow {workflow_id} is already {current}, cannot mark {requested}")]
  ConflictingStatus {
    workflow_id: String,
    current: WorkflowStatus,
    requested: WorkflowStatus,
  },

  /// Only `completed` and `failed` can be set through `mark_workflow`.
  #[error("workflow status {0} is not terminal")]
  NotTerminal(WorkflowStatus),

  /// Another process holds the worker registration.
  #[error("worker {worker_id} is already running")]
  AlreadyRunning { worker_id: i64 },

  /// The worker registration is not held by a running process.
  #[error("worker {worker_id} is not running")]
  NotRunning { worker_id: i64 },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
  pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
    Self::NotFound {
      entity,
      id: id.into(),
    }
  }
}
