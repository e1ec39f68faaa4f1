use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by every workflow sub-topic on the broker.
pub const WORKFLOW_TOPIC: &str = "workflow";

/// Identifies which handler and graph edges apply to a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKind(String);

impl StepKind {
  /// Absorbing step that completes the workflow.
  pub const MARK_SUCCESS: &'static str = "markSuccess";
  /// Absorbing step that fails the workflow.
  pub const MARK_FAILURE: &'static str = "markFailure";

  pub fn new(kind: impl Into<String>) -> Self {
    Self(kind.into())
  }

  pub fn mark_success() -> Self {
    Self::new(Self::MARK_SUCCESS)
  }

  pub fn mark_failure() -> Self {
    Self::new(Self::MARK_FAILURE)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// True for `markSuccess` and `markFailure`.
  pub fn is_absorbing(&self) -> bool {
    self.0 == Self::MARK_SUCCESS || self.0 == Self::MARK_FAILURE
  }
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Borrow<str> for StepKind {
  fn borrow(&self) -> &str {
    &self.0
  }
}

impl From<&str> for StepKind {
  fn from(kind: &str) -> Self {
    Self::new(kind)
  }
}

impl From<String> for StepKind {
  fn from(kind: String) -> Self {
    Self(kind)
  }
}

/// Identifies a family of sagas sharing one step graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowKind(String);

impl WorkflowKind {
  pub fn new(kind: impl Into<String>) -> Self {
    Self(kind.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The logical broker sub-topic for this kind, `workflow.<kind>`.
  pub fn topic(&self) -> String {
    format!("{}.{}", WORKFLOW_TOPIC, self.0)
  }

  /// Parse a `workflow.<kind>` sub-topic back into a kind.
  pub fn from_topic(topic: &str) -> Option<Self> {
    topic
      .strip_prefix(WORKFLOW_TOPIC)
      .and_then(|rest| rest.strip_prefix('.'))
      .filter(|kind| !kind.is_empty())
      .map(Self::new)
  }
}

impl fmt::Display for WorkflowKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Borrow<str> for WorkflowKind {
  fn borrow(&self) -> &str {
    &self.0
  }
}

impl From<&str> for WorkflowKind {
  fn from(kind: &str) -> Self {
    Self::new(kind)
  }
}
