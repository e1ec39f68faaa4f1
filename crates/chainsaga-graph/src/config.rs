use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kind::{StepKind, WorkflowKind};

/// Transitions and data dependencies for one step kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
  /// Successor kinds scheduled when the step completes `done`.
  #[serde(default)]
  pub on_success: Vec<StepKind>,
  /// Successor scheduled when the step completes `failed`.
  #[serde(default = "StepKind::mark_failure")]
  pub on_failure: StepKind,
  /// Prior steps whose persisted responses feed this step's input.
  #[serde(default)]
  pub read_data_from: Vec<StepKind>,
  /// Earlier step re-published when the handler cannot proceed yet.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_from: Option<StepKind>,
  /// Name of the registered handler; defaults to the step kind.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub handler: Option<String>,
}

impl StepConfig {
  /// A step that succeeds into `on_success` and fails into `markFailure`.
  pub fn new(on_success: impl IntoIterator<Item = impl Into<StepKind>>) -> Self {
    Self {
      on_success: on_success.into_iter().map(Into::into).collect(),
      on_failure: StepKind::mark_failure(),
      read_data_from: Vec::new(),
      retry_from: None,
      handler: None,
    }
  }

  pub fn on_failure(mut self, kind: impl Into<StepKind>) -> Self {
    self.on_failure = kind.into();
    self
  }

  pub fn read_data_from(mut self, kinds: impl IntoIterator<Item = impl Into<StepKind>>) -> Self {
    self.read_data_from = kinds.into_iter().map(Into::into).collect();
    self
  }

  pub fn retry_from(mut self, kind: impl Into<StepKind>) -> Self {
    self.retry_from = Some(kind.into());
    self
  }

  pub fn handler(mut self, name: impl Into<String>) -> Self {
    self.handler = Some(name.into());
    self
  }
}

/// Serializable definition of a workflow's step graph.
///
/// ```json
/// {
///   "kind": "stake",
///   "init": "stakeInit",
///   "steps": {
///     "stakeInit": { "on_success": ["approve"] },
///     "approve": { "on_success": ["markSuccess"], "on_failure": "rollback" },
///     "rollback": { "on_success": ["markFailure"] }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDef {
  pub kind: WorkflowKind,
  pub init: StepKind,
  pub steps: BTreeMap<StepKind, StepConfig>,
}
