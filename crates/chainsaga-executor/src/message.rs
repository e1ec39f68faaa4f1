use chainsaga_broker::BrokerMessage;
use chainsaga_graph::{StepKind, WorkflowKind};
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// What the receiver of a step message should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
  /// Execute the step.
  Queued,
  /// Complete a `processing` step as done; `requestParams` is the response.
  Done,
  /// Complete a `processing` step as failed; `requestParams` is the response.
  Failed,
}

/// Payload of every `workflow.<kind>` broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMessage {
  pub workflow_id: String,
  pub step_kind: StepKind,
  #[serde(default)]
  pub parent_step_id: Option<String>,
  pub status: MessageStatus,
  #[serde(default)]
  pub request_params: serde_json::Value,
}

impl StepMessage {
  pub fn queued(
    workflow_id: impl Into<String>,
    step_kind: StepKind,
    parent_step_id: Option<String>,
    request_params: serde_json::Value,
  ) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      step_kind,
      parent_step_id,
      status: MessageStatus::Queued,
      request_params,
    }
  }

  /// The same step, re-entered with a final status and response.
  pub fn reentry(&self, status: MessageStatus, response: serde_json::Value) -> Self {
    Self {
      status,
      request_params: response,
      ..self.clone()
    }
  }

  pub fn to_broker(&self, workflow_kind: &WorkflowKind) -> Result<BrokerMessage, ExecutorError> {
    Ok(BrokerMessage::new(
      workflow_kind.topic(),
      serde_json::to_value(self)?,
    ))
  }

  pub fn from_broker(message: &BrokerMessage) -> Result<Self, ExecutorError> {
    serde_json::from_value(message.payload().clone()).map_err(ExecutorError::MalformedMessage)
  }
}
