//! Error codes recorded in the response of steps the executor fails.

/// The handler returned an error or panicked.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// The handler rejected its request params.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// A chain strategy call failed.
pub const CHAIN_ERROR: &str = "CHAIN_ERROR";
/// The step asked for a retry after using up its retries.
pub const RETRY_LIMIT_EXCEEDED: &str = "RETRY_LIMIT_EXCEEDED";
/// The retry target is not a step that already ran in this workflow.
pub const INVALID_RETRY_TARGET: &str = "INVALID_RETRY_TARGET";
/// A pending outcome carried neither a transaction hash nor a retry target.
pub const INVALID_PENDING_OUTCOME: &str = "INVALID_PENDING_OUTCOME";
/// The step sat in `processing` past the stale timeout.
pub const STALE_STEP: &str = "STALE_STEP";
/// The chain reverted the step's transaction.
pub const TRANSACTION_REVERTED: &str = "TRANSACTION_REVERTED";

/// Standard failure response body.
pub fn failure(code: &str, message: impl Into<String>) -> serde_json::Value {
  serde_json::json!({
    "code": code,
    "message": message.into(),
  })
}
