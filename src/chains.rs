//! JSON-RPC chain access for EVM-style nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chainsaga_executor::{ChainError, ChainStrategy, TxStatus};
use chainsaga_store::PendingOperation;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct RpcResponse {
  #[serde(default)]
  result: serde_json::Value,
  error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
  code: i64,
  message: String,
}

/// Minimal JSON-RPC 2.0 client for one chain.
pub struct RpcClient {
  client: Client,
  url: String,
  chain_id: i64,
  next_id: AtomicU64,
}

impl RpcClient {
  pub fn new(chain_id: i64, url: impl Into<String>) -> Self {
    Self {
      client: Client::new(),
      url: url.into(),
      chain_id,
      next_id: AtomicU64::new(1),
    }
  }

  pub fn chain_id(&self) -> i64 {
    self.chain_id
  }

  pub async fn call(
    &self,
    method: &str,
    params: serde_json::Value,
  ) -> Result<serde_json::Value, ChainError> {
    let body = json!({
      "jsonrpc": "2.0",
      "id": self.next_id.fetch_add(1, Ordering::Relaxed),
      "method": method,
      "params": params,
    });

    let response: RpcResponse = self
      .client
      .post(&self.url)
      .json(&body)
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| self.error(format!("{method}: {e}")))?
      .json()
      .await
      .map_err(|e| self.error(format!("{method}: invalid response: {e}")))?;

    match response.error {
      Some(error) => Err(self.error(format!("{method}: {} ({})", error.message, error.code))),
      None => Ok(response.result),
    }
  }

  fn error(&self, message: String) -> ChainError {
    ChainError::Rpc {
      chain_id: self.chain_id,
      message,
    }
  }
}

/// Resolves transaction finality from `eth_getTransactionReceipt`.
pub struct JsonRpcChain {
  rpc: Arc<RpcClient>,
}

impl JsonRpcChain {
  pub fn new(rpc: Arc<RpcClient>) -> Self {
    Self { rpc }
  }
}

#[async_trait]
impl ChainStrategy for JsonRpcChain {
  fn chain_id(&self) -> i64 {
    self.rpc.chain_id()
  }

  async fn transaction_status(&self, operation: &PendingOperation) -> Result<TxStatus, ChainError> {
    let tx_hash =
      operation
        .tx_hash
        .as_deref()
        .ok_or_else(|| ChainError::InvalidTransaction {
          transaction_uuid: operation.transaction_uuid.clone(),
          message: "no transaction hash recorded".to_string(),
        })?;

    let receipt = self
      .rpc
      .call("eth_getTransactionReceipt", json!([tx_hash]))
      .await?;
    Ok(receipt_status(tx_hash, &receipt))
  }
}

/// A missing receipt is still pending. Receipts without a `status` field
/// predate status codes and count as confirmed.
fn receipt_status(tx_hash: &str, receipt: &serde_json::Value) -> TxStatus {
  if receipt.is_null() {
    return TxStatus::Pending;
  }

  let response = json!({
    "txHash": tx_hash,
    "blockNumber": receipt["blockNumber"],
    "gasUsed": receipt["gasUsed"],
  });
  match receipt["status"].as_str() {
    Some("0x0") => TxStatus::Reverted(response),
    _ => TxStatus::Confirmed(response),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_receipt_status() {
    assert_eq!(
      receipt_status("0xabc", &serde_json::Value::Null),
      TxStatus::Pending
    );

    let confirmed = receipt_status(
      "0xabc",
      &json!({ "status": "0x1", "blockNumber": "0x10", "gasUsed": "0x5208" }),
    );
    assert_eq!(
      confirmed,
      TxStatus::Confirmed(json!({
        "txHash": "0xabc",
        "blockNumber": "0x10",
        "gasUsed": "0x5208",
      }))
    );

    let reverted = receipt_status("0xabc", &json!({ "status": "0x0", "blockNumber": "0x11" }));
    assert!(matches!(reverted, TxStatus::Reverted(response) if response["blockNumber"] == "0x11"));
  }

  #[test]
  fn test_rpc_response_shapes() {
    let ok: RpcResponse =
      serde_json::from_str(r#"{ "jsonrpc": "2.0", "id": 1, "result": null }"#).unwrap();
    assert!(ok.result.is_null());
    assert!(ok.error.is_none());

    let failed: RpcResponse = serde_json::from_str(
      r#"{ "jsonrpc": "2.0", "id": 2, "error": { "code": -32000, "message": "nonce too low" } }"#,
    )
    .unwrap();
    let error = failed.error.unwrap();
    assert_eq!(error.code, -32000);
    assert_eq!(error.message, "nonce too low");
  }
}
