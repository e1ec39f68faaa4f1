//! Topic to executor routing.

use std::collections::HashMap;
use std::sync::Arc;

use chainsaga_broker::BrokerMessage;
use chainsaga_graph::{WORKFLOW_TOPIC, WorkflowKind};
use tracing::instrument;

use crate::error::ExecutorError;
use crate::executor::{Disposition, StepExecutor};
use crate::message::StepMessage;

/// Routes `workflow.<kind>` messages to the executor for `<kind>`.
#[derive(Default)]
pub struct Dispatcher {
  executors: HashMap<WorkflowKind, Arc<StepExecutor>>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the executor for a workflow kind.
  ///
  /// The factory runs immediately, so a graph or handler mismatch surfaces
  /// at startup.
  pub fn register<F>(&mut self, kind: WorkflowKind, factory: F) -> Result<(), ExecutorError>
  where
    F: FnOnce() -> Result<StepExecutor, ExecutorError>,
  {
    if self.executors.contains_key(&kind) {
      return Err(ExecutorError::DuplicateWorkflow(kind));
    }

    let executor = factory()?;
    if executor.kind() != &kind {
      return Err(ExecutorError::KindMismatch {
        expected: kind,
        actual: executor.kind().clone(),
      });
    }

    self.executors.insert(kind, Arc::new(executor));
    Ok(())
  }

  /// The topic prefix a worker subscribes to.
  pub fn topic(&self) -> &'static str {
    WORKFLOW_TOPIC
  }

  /// Resolve the executor for a message and decode its payload.
  pub fn route(
    &self,
    message: &BrokerMessage,
  ) -> Result<(Arc<StepExecutor>, StepMessage), ExecutorError> {
    let executor = WorkflowKind::from_topic(&message.topic)
      .and_then(|kind| self.executors.get(&kind))
      .cloned()
      .ok_or_else(|| ExecutorError::UnsupportedWorkflow {
        topic: message.topic.clone(),
      })?;
    let step = StepMessage::from_broker(message)?;
    Ok((executor, step))
  }

  /// Route and handle one broker message.
  #[instrument(name = "dispatch", skip_all, fields(topic = %message.topic))]
  pub async fn dispatch(&self, message: &BrokerMessage) -> Result<Disposition, ExecutorError> {
    let (executor, step) = self.route(message)?;
    executor.handle(step).await
  }

  /// Start a workflow of the given kind.
  pub async fn start(
    &self,
    kind: &str,
    client_id: i64,
    chain_id: i64,
    params: serde_json::Value,
  ) -> Result<String, ExecutorError> {
    let executor = self
      .executors
      .get(kind)
      .ok_or_else(|| ExecutorError::UnsupportedWorkflow {
        topic: WorkflowKind::new(kind).topic(),
      })?;
    executor.start(client_id, chain_id, params).await
  }
}
