use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a workflow (saga instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkflowStatus {
  Queued,
  InProgress,
  Completed,
  Failed,
}

impl WorkflowStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Queued => "queued",
      Self::InProgress => "in_progress",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

impl fmt::Display for WorkflowStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StepStatus {
  Queued,
  Processing,
  Done,
  Failed,
}

impl StepStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Queued => "queued",
      Self::Processing => "processing",
      Self::Done => "done",
      Self::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Done | Self::Failed)
  }
}

impl fmt::Display for StepStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Status of a worker registration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkerStatus {
  Running,
  Stopped,
}

/// A workflow as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Workflow {
  pub id: String,
  pub kind: String,
  pub status: WorkflowStatus,
  pub client_id: i64,
  pub chain_id: i64,
  pub params: Json<serde_json::Value>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A workflow step as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowStep {
  pub id: String,
  pub workflow_id: String,
  pub kind: String,
  pub parent_id: Option<String>,
  pub status: StepStatus,
  pub request_params: Json<serde_json::Value>,
  pub response_data: Option<Json<serde_json::Value>>,
  pub retry_count: i32,
  pub transaction_hash: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A worker process registration (`cron_processes` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkerRegistration {
  pub id: i64,
  pub kind: String,
  pub status: WorkerStatus,
  pub params_json: Json<serde_json::Value>,
  pub last_started_at: Option<DateTime<Utc>>,
  pub last_ended_at: Option<DateTime<Utc>>,
}

/// An externally submitted chain transaction awaiting finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingOperation {
  pub transaction_uuid: String,
  pub chain_id: i64,
  pub tx_hash: Option<String>,
  pub raw_transaction: Json<serde_json::Value>,
  /// Broker message published once the transaction is finalized.
  pub after_completion: Json<serde_json::Value>,
  pub created_at: DateTime<Utc>,
}

/// Input for [`WorkflowStore::create_workflow`](crate::WorkflowStore::create_workflow).
#[derive(Debug, Clone)]
pub struct NewWorkflow {
  pub kind: String,
  pub client_id: i64,
  pub chain_id: i64,
  pub params: serde_json::Value,
}

/// Input for [`WorkflowStore::insert_step`](crate::WorkflowStore::insert_step).
#[derive(Debug, Clone)]
pub struct NewStep {
  pub workflow_id: String,
  pub kind: String,
  pub parent_id: Option<String>,
  pub request: serde_json::Value,
  pub retry_count: i32,
}

impl NewStep {
  pub fn new(
    workflow_id: impl Into<String>,
    kind: impl Into<String>,
    parent_id: Option<String>,
    request: serde_json::Value,
  ) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      kind: kind.into(),
      parent_id,
      request,
      retry_count: 0,
    }
  }

  pub fn with_retry_count(mut self, retry_count: i32) -> Self {
    self.retry_count = retry_count;
    self
  }
}

/// Input for [`WorkflowStore::complete_step`](crate::WorkflowStore::complete_step):
/// the step's terminal status and everything it leads to.
#[derive(Debug, Clone)]
pub struct StepCompletion {
  pub status: StepStatus,
  pub response: serde_json::Value,
  /// Bump the step's retry count. Set when the step is failed to rewind
  /// the workflow.
  pub retry: bool,
  /// Successors inserted `queued`. Keys that already exist are left as they are.
  pub successors: Vec<NewStep>,
  /// Absorbing steps, inserted `done`.
  pub absorbed: Vec<NewStep>,
  /// Terminal workflow status reached through `absorbed`.
  pub workflow_status: Option<WorkflowStatus>,
}

impl StepCompletion {
  pub fn new(status: StepStatus, response: serde_json::Value) -> Self {
    Self {
      status,
      response,
      retry: false,
      successors: Vec::new(),
      absorbed: Vec::new(),
      workflow_status: None,
    }
  }

  /// Fail the step and bump its retry count.
  pub fn retried(response: serde_json::Value) -> Self {
    Self {
      retry: true,
      ..Self::new(StepStatus::Failed, response)
    }
  }

  pub fn with_successor(mut self, step: NewStep) -> Self {
    self.successors.push(step);
    self
  }

  /// Record an absorbing step and the workflow status it implies. The first
  /// terminal status wins.
  pub fn with_terminal(mut self, step: NewStep, status: WorkflowStatus) -> Self {
    self.absorbed.push(step);
    self.workflow_status.get_or_insert(status);
    self
  }
}

/// Result of a terminal workflow transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowMark {
  /// The workflow moved to the requested status.
  Changed(WorkflowStatus),
  /// The workflow already had the requested status.
  Unchanged(WorkflowStatus),
  /// The workflow already had a different terminal status.
  Conflict {
    current: WorkflowStatus,
    requested: WorkflowStatus,
  },
}

/// What [`WorkflowStore::complete_step`](crate::WorkflowStore::complete_step) committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStep {
  pub retry_count: i32,
  /// Successors still `queued` after the commit, whether inserted now or
  /// already present.
  pub queued: Vec<WorkflowStep>,
  pub workflow: Option<WorkflowMark>,
}
