//! Execution events and notifiers.
//!
//! The executor emits an [`ExecutionEvent`] at each step and workflow
//! transition. Terminal workflow events are the postprocessor hook: a
//! notifier may forward them to webhooks, caches or other side channels.

use async_trait::async_trait;
use chainsaga_graph::{StepKind, WorkflowKind};
use chainsaga_store::StepStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A workflow was created and its init step published.
  WorkflowStarted {
    workflow_id: String,
    workflow_kind: WorkflowKind,
  },

  /// A step's handler is about to run.
  StepStarted {
    workflow_id: String,
    step_id: String,
    step_kind: StepKind,
  },

  /// A step reached `done` or `failed`.
  StepCompleted {
    workflow_id: String,
    step_id: String,
    step_kind: StepKind,
    status: StepStatus,
    response: serde_json::Value,
  },

  /// The workflow reached `markSuccess`.
  WorkflowCompleted {
    workflow_id: String,
    workflow_kind: WorkflowKind,
  },

  /// The workflow reached `markFailure`.
  WorkflowFailed {
    workflow_id: String,
    workflow_kind: WorkflowKind,
  },
}

/// Receives execution events.
#[async_trait]
pub trait WorkflowNotifier: Send + Sync {
  async fn notify(&self, event: ExecutionEvent);
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl WorkflowNotifier for NoopNotifier {
  async fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl WorkflowNotifier for ChannelNotifier {
  async fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
