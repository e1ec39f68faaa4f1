//! Runtime parameters stored on the worker's registration row.

use std::collections::BTreeMap;
use std::time::Duration;

use chainsaga_store::WorkerRegistration;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Parameters deserialized from `cron_processes.params_json`.
///
/// Every field has a default, so `{}` is a valid parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeParams {
  /// Maximum unacknowledged deliveries, and so concurrently running steps.
  pub prefetch_count: usize,
  /// Chain whose pending operations this worker finalizes.
  pub chain_id: i64,
  /// JSON-RPC endpoints keyed by chain id.
  pub rpc_urls: BTreeMap<i64, String>,
  /// A task in flight longer than this is a zombie.
  pub zombie_timeout_ms: u64,
  /// Terminate once more than this many zombies exist at once.
  pub max_zombie_count: usize,
  pub health_check_interval_ms: u64,
  pub drain_poll_interval_ms: u64,
  /// Raise an alert if draining takes longer than this.
  pub drain_alert_after_secs: u64,
  pub finalizer_interval_ms: u64,
  pub finalizer_batch_size: i64,
  pub sweeper_interval_secs: u64,
  /// A `processing` step without a transaction hash, or a `queued` step,
  /// idle for longer than this is swept.
  pub stale_step_timeout_secs: u64,
  pub max_step_retries: i32,
}

impl Default for RuntimeParams {
  fn default() -> Self {
    Self {
      prefetch_count: 10,
      chain_id: 1,
      rpc_urls: BTreeMap::new(),
      zombie_timeout_ms: 300_000,
      max_zombie_count: 3,
      health_check_interval_ms: 1_000,
      drain_poll_interval_ms: 1_000,
      drain_alert_after_secs: 60,
      finalizer_interval_ms: 5_000,
      finalizer_batch_size: 50,
      sweeper_interval_secs: 60,
      stale_step_timeout_secs: 900,
      max_step_retries: 1,
    }
  }
}

impl RuntimeParams {
  /// Parse and validate the params of a registration row.
  pub fn from_registration(registration: &WorkerRegistration) -> Result<Self, WorkerError> {
    let params: Self = serde_json::from_value(registration.params_json.0.clone())
      .map_err(|source| WorkerError::InvalidParams {
        worker_id: registration.id,
        source,
      })?;
    params.validate()?;
    Ok(params)
  }

  pub fn validate(&self) -> Result<(), WorkerError> {
    if self.prefetch_count == 0 {
      return Err(WorkerError::InvalidConfig(
        "prefetchCount must be at least 1".to_string(),
      ));
    }
    if self.finalizer_batch_size <= 0 {
      return Err(WorkerError::InvalidConfig(
        "finalizerBatchSize must be positive".to_string(),
      ));
    }
    for (name, value) in [
      ("healthCheckIntervalMs", self.health_check_interval_ms),
      ("drainPollIntervalMs", self.drain_poll_interval_ms),
      ("finalizerIntervalMs", self.finalizer_interval_ms),
      ("sweeperIntervalSecs", self.sweeper_interval_secs),
    ] {
      if value == 0 {
        return Err(WorkerError::InvalidConfig(format!("{name} must be positive")));
      }
    }
    if self.max_step_retries < 0 {
      return Err(WorkerError::InvalidConfig(
        "maxStepRetries must not be negative".to_string(),
      ));
    }
    Ok(())
  }

  pub fn zombie_timeout(&self) -> Duration {
    Duration::from_millis(self.zombie_timeout_ms)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_millis(self.health_check_interval_ms)
  }

  pub fn drain_poll_interval(&self) -> Duration {
    Duration::from_millis(self.drain_poll_interval_ms)
  }

  pub fn drain_alert_after(&self) -> Duration {
    Duration::from_secs(self.drain_alert_after_secs)
  }

  pub fn finalizer_interval(&self) -> Duration {
    Duration::from_millis(self.finalizer_interval_ms)
  }

  pub fn sweeper_interval(&self) -> Duration {
    Duration::from_secs(self.sweeper_interval_secs)
  }

  pub fn stale_step_timeout(&self) -> Duration {
    Duration::from_secs(self.stale_step_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use chainsaga_store::{Json, WorkerStatus};
  use serde_json::json;

  use super::*;

  fn registration(params: serde_json::Value) -> WorkerRegistration {
    WorkerRegistration {
      id: 4,
      kind: "workflow".to_string(),
      status: WorkerStatus::Running,
      params_json: Json(params),
      last_started_at: None,
      last_ended_at: None,
    }
  }

  #[test]
  fn test_empty_params_use_defaults() {
    let params = RuntimeParams::from_registration(&registration(json!({}))).unwrap();
    assert_eq!(params, RuntimeParams::default());
    assert_eq!(params.drain_poll_interval(), Duration::from_secs(1));
    assert_eq!(params.drain_alert_after(), Duration::from_secs(60));
  }

  #[test]
  fn test_camel_case_fields() {
    let params = RuntimeParams::from_registration(&registration(json!({
      "prefetchCount": 25,
      "chainId": 137,
      "rpcUrls": { "137": "http://localhost:8545" },
      "maxZombieCount": 1,
    })))
    .unwrap();

    assert_eq!(params.prefetch_count, 25);
    assert_eq!(params.chain_id, 137);
    assert_eq!(params.rpc_urls[&137], "http://localhost:8545");
    assert_eq!(params.max_zombie_count, 1);
    assert_eq!(params.zombie_timeout(), Duration::from_secs(300));
  }

  #[test]
  fn test_invalid_params() {
    assert!(matches!(
      RuntimeParams::from_registration(&registration(json!({ "prefetchCount": 0 }))),
      Err(WorkerError::InvalidConfig(_))
    ));
    assert!(matches!(
      RuntimeParams::from_registration(&registration(json!({ "drainPollIntervalMs": 0 }))),
      Err(WorkerError::InvalidConfig(message)) if message.contains("drainPollIntervalMs")
    ));
    assert!(matches!(
      RuntimeParams::from_registration(&registration(json!({ "prefetchCount": "many" }))),
      Err(WorkerError::InvalidParams { worker_id: 4, .. })
    ));
  }
}
