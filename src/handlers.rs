//! Step handlers shipped with the worker binary.
//!
//! Workflow files refer to these by name through a step's `handler` field.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chainsaga_executor::{
  HandlerError, HandlerRegistry, StepContext, StepHandler, StepInput, StepOutcome, codes,
};
use serde_json::json;
use tracing::info;

use crate::chains::RpcClient;

pub fn builtin(rpc: HashMap<i64, Arc<RpcClient>>) -> HandlerRegistry {
  HandlerRegistry::new()
    .with("passthrough", Passthrough)
    .with("reject", Reject)
    .with("broadcast", Broadcast { rpc })
}

/// Completes with its params and the ancestor responses it was given.
pub struct Passthrough;

#[async_trait]
impl StepHandler for Passthrough {
  async fn handle(&self, _ctx: &StepContext, input: StepInput) -> Result<StepOutcome, HandlerError> {
    Ok(StepOutcome::done(json!({
      "params": input.params,
      "ancestors": input.ancestor_responses,
    })))
  }
}

/// Always fails, with the `reason` param as message.
pub struct Reject;

#[async_trait]
impl StepHandler for Reject {
  async fn handle(&self, _ctx: &StepContext, input: StepInput) -> Result<StepOutcome, HandlerError> {
    let reason = input.params["reason"].as_str().unwrap_or("rejected");
    Ok(StepOutcome::failed_with_code(codes::INVALID_PARAMS, reason))
  }
}

/// Sends the signed `rawTransaction` param and waits for it to finalize.
pub struct Broadcast {
  rpc: HashMap<i64, Arc<RpcClient>>,
}

#[async_trait]
impl StepHandler for Broadcast {
  async fn handle(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutcome, HandlerError> {
    let raw = input.params["rawTransaction"]
      .as_str()
      .ok_or_else(|| HandlerError::InvalidParams("rawTransaction must be a hex string".into()))?;

    let chain_id = ctx.chain().chain_id();
    let rpc = self
      .rpc
      .get(&chain_id)
      .ok_or_else(|| HandlerError::Other(format!("no rpc endpoint for chain {chain_id}")))?;

    let tx_hash = rpc.call("eth_sendRawTransaction", json!([raw])).await?;
    let tx_hash = tx_hash
      .as_str()
      .ok_or_else(|| HandlerError::Other(format!("unexpected transaction hash: {tx_hash}")))?;

    ctx
      .track_transaction(tx_hash, json!({ "rawTransaction": raw }))
      .await?;
    info!(workflow_id = ctx.workflow_id(), tx_hash, "transaction_broadcast");
    Ok(StepOutcome::awaiting(tx_hash))
  }
}
