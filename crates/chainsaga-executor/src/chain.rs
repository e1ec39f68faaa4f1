//! Per-chain strategies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chainsaga_store::PendingOperation;

use crate::error::{ChainError, ExecutorError};

/// Finality of a submitted transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
  Pending,
  /// Included and successful; carries the response for the waiting step.
  Confirmed(serde_json::Value),
  /// Included but reverted; carries the failure details.
  Reverted(serde_json::Value),
}

/// Chain-specific behaviour used by handlers and the finalizer.
#[async_trait]
pub trait ChainStrategy: Send + Sync {
  fn chain_id(&self) -> i64;

  async fn transaction_status(&self, operation: &PendingOperation) -> Result<TxStatus, ChainError>;
}

/// Strategies keyed by chain id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
  strategies: HashMap<i64, Arc<dyn ChainStrategy>>,
}

impl ChainRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a strategy under its own chain id, replacing any previous one.
  pub fn register(&mut self, strategy: Arc<dyn ChainStrategy>) {
    self.strategies.insert(strategy.chain_id(), strategy);
  }

  pub fn with(mut self, strategy: Arc<dyn ChainStrategy>) -> Self {
    self.register(strategy);
    self
  }

  pub fn resolve(&self, chain_id: i64) -> Result<Arc<dyn ChainStrategy>, ExecutorError> {
    self
      .strategies
      .get(&chain_id)
      .cloned()
      .ok_or(ExecutorError::UnknownChain { chain_id })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed(i64);

  #[async_trait]
  impl ChainStrategy for Fixed {
    fn chain_id(&self) -> i64 {
      self.0
    }

    async fn transaction_status(&self, _: &PendingOperation) -> Result<TxStatus, ChainError> {
      Ok(TxStatus::Pending)
    }
  }

  #[test]
  fn test_resolve_by_chain_id() {
    let registry = ChainRegistry::new()
      .with(Arc::new(Fixed(1)))
      .with(Arc::new(Fixed(137)));

    assert_eq!(registry.resolve(137).unwrap().chain_id(), 137);
    assert_eq!(registry.resolve(1).unwrap().chain_id(), 1);
    assert!(matches!(
      registry.resolve(5),
      Err(ExecutorError::UnknownChain { chain_id: 5 })
    ));
  }
}
