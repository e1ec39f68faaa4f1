//! Chainsaga Store
//!
//! Durable state for the workflow engine. Three storage traits are defined
//! here and implemented by [`SqliteStore`]:
//!
//! - [`WorkflowStore`]: the workflow and step ledger, the single source of
//!   truth for what has already happened
//! - [`WorkerRegistry`]: `cron_processes` rows used as per-process
//!   mutual-exclusion tokens
//! - [`PendingOperationTracker`]: chain transactions submitted by step
//!   handlers that are waiting for finalization

mod error;
mod sqlite;
mod types;

pub use error::StoreError;
pub use sqlite::SqliteStore;
pub use sqlx::types::Json;
pub use types::{
  CompletedStep, NewStep, NewWorkflow, PendingOperation, StepCompletion, StepStatus,
  WorkerRegistration, WorkerStatus, Workflow, WorkflowMark, WorkflowStatus, WorkflowStep,
};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The workflow and step ledger.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
  /// Insert a workflow in `queued` and return its id.
  async fn create_workflow(&self, workflow: NewWorkflow) -> Result<String, StoreError>;

  /// Get a workflow by id.
  async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StoreError>;

  /// Insert a step in `queued` and return its id.
  ///
  /// Fails with [`StoreError::DuplicateStep`] if the
  /// `(workflow_id, kind, parent_id)` key already exists.
  async fn insert_step(&self, step: NewStep) -> Result<String, StoreError>;

  /// Get a step by id.
  async fn get_step(&self, step_id: &str) -> Result<WorkflowStep, StoreError>;

  /// Look a step up by its dedup key.
  async fn find_step(
    &self,
    workflow_id: &str,
    kind: &str,
    parent_id: Option<&str>,
  ) -> Result<Option<WorkflowStep>, StoreError>;

  /// The nearest step of `kind` on the parent chain of `step_id`, excluding
  /// `step_id` itself.
  async fn find_ancestor(
    &self,
    step_id: &str,
    kind: &str,
  ) -> Result<Option<WorkflowStep>, StoreError>;

  /// All steps of a workflow in creation order.
  async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, StoreError>;

  /// Atomically move a step `queued -> processing` and return its request.
  ///
  /// The owning workflow moves `queued -> in_progress` in the same
  /// transaction. Fails with [`StoreError::AlreadyProcessing`] when the step
  /// is no longer queued.
  async fn begin_step(&self, step_id: &str) -> Result<serde_json::Value, StoreError>;

  /// Move a step `processing -> done|failed` in one transaction with its
  /// successor rows, absorbing rows and terminal workflow status.
  ///
  /// Fails with [`StoreError::InvalidTransition`] and writes nothing when
  /// the step is not `processing`. A conflicting terminal workflow status is
  /// reported in the result and does not roll the step back.
  async fn complete_step(
    &self,
    step_id: &str,
    completion: StepCompletion,
  ) -> Result<CompletedStep, StoreError>;

  /// Record the chain transaction hash of a `processing` step.
  async fn record_transaction(&self, step_id: &str, tx_hash: &str) -> Result<(), StoreError>;

  /// Resolve the responses of the nearest ancestors of `step_id` whose kind
  /// is in `kinds`. Only the parent chain is walked, so siblings are never
  /// visible. Kinds without a persisted response are absent from the map.
  async fn load_ancestor_responses(
    &self,
    step_id: &str,
    kinds: &[&str],
  ) -> Result<HashMap<String, serde_json::Value>, StoreError>;

  /// Terminal workflow transition.
  ///
  /// Returns `true` when the status changed and `false` when the workflow
  /// already had the requested status. A conflicting terminal status is
  /// [`StoreError::ConflictingStatus`].
  async fn mark_workflow(
    &self,
    workflow_id: &str,
    status: WorkflowStatus,
  ) -> Result<bool, StoreError>;

  /// Claim steps in `processing` without a transaction hash whose last
  /// update is older than `before`.
  ///
  /// Claiming stamps `updated_at`, so a step is returned again only once it
  /// has been idle past another cutoff.
  async fn claim_stale_steps(&self, before: DateTime<Utc>)
  -> Result<Vec<WorkflowStep>, StoreError>;

  /// Claim steps still `queued` whose last update is older than `before`,
  /// stamping `updated_at` like [`WorkflowStore::claim_stale_steps`].
  async fn claim_idle_queued_steps(
    &self,
    before: DateTime<Utc>,
  ) -> Result<Vec<WorkflowStep>, StoreError>;
}

/// Worker registration rows (`cron_processes`).
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
  /// Create the row in `stopped`, or refresh kind and params if it exists.
  async fn register(
    &self,
    worker_id: i64,
    kind: &str,
    params: &serde_json::Value,
  ) -> Result<WorkerRegistration, StoreError>;

  /// Get a registration by id.
  async fn get_worker(&self, worker_id: i64) -> Result<WorkerRegistration, StoreError>;

  /// Conditional `stopped -> running`. Fails with
  /// [`StoreError::AlreadyRunning`] when another process holds the row.
  async fn claim(&self, worker_id: i64) -> Result<WorkerRegistration, StoreError>;

  /// `running -> stopped`, stamping `last_ended_at`.
  async fn release(&self, worker_id: i64) -> Result<(), StoreError>;
}

/// Chain transactions awaiting finalization.
#[async_trait]
pub trait PendingOperationTracker: Send + Sync {
  async fn record(&self, operation: &PendingOperation) -> Result<(), StoreError>;

  async fn get_operation(&self, transaction_uuid: &str) -> Result<PendingOperation, StoreError>;

  /// Oldest first.
  async fn list_operations(
    &self,
    chain_id: i64,
    limit: i64,
  ) -> Result<Vec<PendingOperation>, StoreError>;

  /// Returns `false` if the operation was already gone.
  async fn remove(&self, transaction_uuid: &str) -> Result<bool, StoreError>;
}
