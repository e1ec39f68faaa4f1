//! Step handler contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chainsaga_graph::StepKind;
use serde::{Deserialize, Serialize};

use crate::codes;
use crate::context::StepContext;
use crate::error::HandlerError;

/// Input handed to a step handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
  /// The step's persisted request.
  pub params: serde_json::Value,
  /// Responses of the step's `readDataFrom` ancestors, keyed by step kind.
  pub ancestor_responses: HashMap<String, serde_json::Value>,
}

impl StepInput {
  pub fn ancestor(&self, kind: &str) -> Option<&serde_json::Value> {
    self.ancestor_responses.get(kind)
  }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StepOutcome {
  Done {
    response: serde_json::Value,
  },
  Failed {
    response: serde_json::Value,
  },
  /// The step cannot finish yet.
  ///
  /// With a `tx_hash` the step waits for that chain transaction. With a
  /// `retry_from_step_kind` the workflow is rewound to that earlier step.
  Pending {
    #[serde(default)]
    response: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_from_step_kind: Option<StepKind>,
  },
}

impl StepOutcome {
  pub fn done(response: serde_json::Value) -> Self {
    Self::Done { response }
  }

  pub fn failed(response: serde_json::Value) -> Self {
    Self::Failed { response }
  }

  /// A failure carrying the standard `{code, message}` response.
  pub fn failed_with_code(code: &str, message: impl Into<String>) -> Self {
    Self::Failed {
      response: codes::failure(code, message),
    }
  }

  /// A chain transaction was submitted; the step resumes once it finalizes.
  pub fn awaiting(tx_hash: impl Into<String>) -> Self {
    Self::Pending {
      response: serde_json::Value::Null,
      tx_hash: Some(tx_hash.into()),
      retry_from_step_kind: None,
    }
  }

  /// Rewind the workflow to an earlier step.
  pub fn retry_from(kind: impl Into<StepKind>, response: serde_json::Value) -> Self {
    Self::Pending {
      response,
      tx_hash: None,
      retry_from_step_kind: Some(kind.into()),
    }
  }
}

/// Business logic for one step kind.
///
/// Handlers run at most once per step row: redelivered messages are
/// suppressed before the handler is reached.
#[async_trait]
pub trait StepHandler: Send + Sync {
  async fn handle(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutcome, HandlerError>;
}

/// Named step handlers, resolved when an executor is built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler + 'static) {
    self.handlers.insert(name.into(), Arc::new(handler));
  }

  pub fn with(mut self, name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
    self.register(name, handler);
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
    self.handlers.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.handlers.contains_key(name)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_outcome_wire_shape() {
    let pending: StepOutcome = serde_json::from_value(json!({
      "outcome": "pending",
      "txHash": "0xabc",
    }))
    .unwrap();
    assert_eq!(pending, StepOutcome::awaiting("0xabc"));

    let retry = StepOutcome::retry_from("init", json!({ "reason": "proof" }));
    assert_eq!(
      serde_json::to_value(&retry).unwrap(),
      json!({
        "outcome": "pending",
        "response": { "reason": "proof" },
        "retryFromStepKind": "init",
      })
    );

    let failed = StepOutcome::failed_with_code(codes::INTERNAL_ERROR, "boom");
    assert_eq!(
      serde_json::to_value(&failed).unwrap(),
      json!({
        "outcome": "failed",
        "response": { "code": "INTERNAL_ERROR", "message": "boom" },
      })
    );
  }

  #[test]
  fn test_input_ancestor_lookup() {
    let input = StepInput {
      params: json!({}),
      ancestor_responses: HashMap::from([("init".to_string(), json!({ "x": 1 }))]),
    };
    assert_eq!(input.ancestor("init"), Some(&json!({ "x": 1 })));
    assert_eq!(input.ancestor("other"), None);
  }
}
