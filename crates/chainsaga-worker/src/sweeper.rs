//! Recovers steps a dead worker or a failed publish left behind.

use std::sync::Arc;
use std::time::Duration;

use chainsaga_broker::Broker;
use chainsaga_executor::codes::{self, STALE_STEP};
use chainsaga_executor::{MessageStatus, StepMessage};
use chainsaga_graph::{StepKind, WorkflowKind};
use chainsaga_store::{WorkflowStep, WorkflowStore};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::error::WorkerError;

/// Periodically claims idle steps and publishes them again.
///
/// A step stuck in `processing` gets a `failed` re-entry: the handler is
/// never run again and the failure routes through the step's `onFailure`
/// edge. A step still `queued` past the timeout gets its `queued` message
/// again, which is a no-op if the original is still on the broker. Steps
/// waiting on a transaction are left to the finalizer.
///
/// Each claim stamps the step, so a step is published at most once per
/// timeout.
pub struct Sweeper {
  store: Arc<dyn WorkflowStore>,
  broker: Arc<dyn Broker>,
  timeout: Duration,
  interval: Duration,
}

impl Sweeper {
  pub fn new(store: Arc<dyn WorkflowStore>, broker: Arc<dyn Broker>, timeout: Duration) -> Self {
    Self {
      store,
      broker,
      timeout,
      interval: Duration::from_secs(60),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Returns how many messages were published.
  #[instrument(name = "sweep", skip_all)]
  pub async fn run_once(&self) -> Result<usize, WorkerError> {
    let cutoff = self.cutoff();

    let stale = self.store.claim_stale_steps(cutoff).await?;
    for step in &stale {
      let failure = codes::failure(
        STALE_STEP,
        format!("step has been processing for longer than {:?}", self.timeout),
      );
      self.publish(step, MessageStatus::Failed, failure).await?;
      warn!(
        workflow_id = %step.workflow_id,
        step_id = %step.id,
        step_kind = %step.kind,
        "stale_step_failed"
      );
    }

    let idle = self.store.claim_idle_queued_steps(cutoff).await?;
    for step in &idle {
      self
        .publish(step, MessageStatus::Queued, step.request_params.0.clone())
        .await?;
      warn!(
        workflow_id = %step.workflow_id,
        step_id = %step.id,
        step_kind = %step.kind,
        "queued_step_republished"
      );
    }

    Ok(stale.len() + idle.len())
  }

  pub async fn run(&self, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = ticker.tick() => {
          if let Err(e) = self.run_once().await {
            error!(error = %e, "sweep_failed");
          }
        }
      }
    }
  }

  async fn publish(
    &self,
    step: &WorkflowStep,
    status: MessageStatus,
    request_params: serde_json::Value,
  ) -> Result<(), WorkerError> {
    let workflow = self.store.get_workflow(&step.workflow_id).await?;
    let message = StepMessage {
      workflow_id: step.workflow_id.clone(),
      step_kind: StepKind::new(step.kind.as_str()),
      parent_step_id: step.parent_id.clone(),
      status,
      request_params,
    };
    self
      .broker
      .publish(message.to_broker(&WorkflowKind::new(workflow.kind))?)
      .await?;
    Ok(())
  }

  fn cutoff(&self) -> DateTime<Utc> {
    TimeDelta::from_std(self.timeout)
      .ok()
      .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }
}
