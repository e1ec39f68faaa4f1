use thiserror::Error;

use crate::StepKind;

/// Errors raised while building a [`StepGraph`](crate::StepGraph).
///
/// All of these are detected once, when the graph is loaded. A graph that
/// builds successfully never produces them at runtime.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("init step '{0}' is not declared")]
  MissingInit(StepKind),

  #[error("step '{0}' is reserved and cannot be declared")]
  ReservedKind(StepKind),

  #[error("edge references unknown step: from={from}, to={to}")]
  UnknownTarget { from: StepKind, to: StepKind },

  #[error("step '{step}' reads data from undeclared step '{source_kind}'")]
  UnknownReadSource {
    step: StepKind,
    source_kind: StepKind,
  },

  #[error("step '{step}' retries from undeclared step '{target}'")]
  UnknownRetryTarget { step: StepKind, target: StepKind },

  #[error("step '{0}' has no success transition")]
  DeadEnd(StepKind),

  #[error("cycle detected through step '{0}'")]
  Cycle(StepKind),

  #[error("step '{0}' is not reachable from the init step")]
  Unreachable(StepKind),

  #[error("invalid graph definition: {0}")]
  Definition(#[from] serde_json::Error),
}
