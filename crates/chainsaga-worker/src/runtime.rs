//! The worker process loop.

use std::sync::Arc;
use std::time::Instant;

use chainsaga_broker::{Broker, Delivery};
use chainsaga_executor::Dispatcher;
use chainsaga_store::WorkerRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::config::RuntimeParams;
use crate::error::WorkerError;
use crate::finalizer::Finalizer;
use crate::inflight::InFlight;
use crate::sweeper::Sweeper;

/// Lifecycle of a worker: `Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
  Running,
  Draining,
  Stopped,
}

/// Claim the registration row and parse its params.
///
/// The row is released again if its params are invalid, so a corrected row
/// can be claimed by the next start.
pub async fn claim(
  registry: &dyn WorkerRegistry,
  worker_id: i64,
) -> Result<RuntimeParams, WorkerError> {
  let registration = registry.claim(worker_id).await?;
  match RuntimeParams::from_registration(&registration) {
    Ok(params) => {
      info!(worker_id, kind = %registration.kind, "worker_claimed");
      Ok(params)
    }
    Err(e) => {
      release(registry, worker_id).await?;
      Err(e)
    }
  }
}

async fn release(registry: &dyn WorkerRegistry, worker_id: i64) -> Result<(), WorkerError> {
  registry
    .release(worker_id)
    .await
    .map_err(|source| WorkerError::Release { worker_id, source })
}

/// Consumes step messages with bounded concurrency until shut down.
pub struct WorkerRuntime {
  worker_id: i64,
  params: RuntimeParams,
  dispatcher: Arc<Dispatcher>,
  broker: Arc<dyn Broker>,
  registry: Arc<dyn WorkerRegistry>,
  finalizer: Option<Arc<Finalizer>>,
  sweeper: Option<Arc<Sweeper>>,
  in_flight: InFlight,
  state: watch::Sender<RuntimeState>,
}

impl WorkerRuntime {
  pub fn new(
    worker_id: i64,
    params: RuntimeParams,
    dispatcher: Arc<Dispatcher>,
    broker: Arc<dyn Broker>,
    registry: Arc<dyn WorkerRegistry>,
  ) -> Self {
    let (state, _) = watch::channel(RuntimeState::Running);
    Self {
      worker_id,
      params,
      dispatcher,
      broker,
      registry,
      finalizer: None,
      sweeper: None,
      in_flight: InFlight::new(),
      state,
    }
  }

  /// Run a finalizer alongside the consumer loop.
  pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
    self.finalizer = Some(Arc::new(finalizer));
    self
  }

  /// Run a stale-step sweeper alongside the consumer loop.
  pub fn with_sweeper(mut self, sweeper: Sweeper) -> Self {
    self.sweeper = Some(Arc::new(sweeper));
    self
  }

  pub fn worker_id(&self) -> i64 {
    self.worker_id
  }

  pub fn params(&self) -> &RuntimeParams {
    &self.params
  }

  pub fn state(&self) -> RuntimeState {
    *self.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
    self.state.subscribe()
  }

  /// Steps currently executing.
  pub fn in_flight(&self) -> usize {
    self.in_flight.count()
  }

  /// Consume until `shutdown` fires, then drain and release the registration.
  ///
  /// The registration row is released before this returns, whatever the
  /// outcome. Exceeding the zombie ceiling skips the drain.
  #[instrument(name = "worker", skip_all, fields(worker_id = self.worker_id))]
  pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
    info!(
      prefetch_count = self.params.prefetch_count,
      topic = self.dispatcher.topic(),
      "worker_started"
    );

    let background = shutdown.child_token();
    let tasks = self.spawn_background(&background);

    let result = self.consume(&shutdown).await;
    self.state.send_replace(RuntimeState::Draining);
    match &result {
      Err(WorkerError::ZombieCeiling { .. }) => {}
      _ => self.drain().await,
    }

    background.cancel();
    for task in tasks {
      if let Err(e) = task.await {
        error!(error = %e, "background_task_panicked");
      }
    }

    release(self.registry.as_ref(), self.worker_id).await?;
    self.state.send_replace(RuntimeState::Stopped);

    match &result {
      Ok(()) => info!("worker_stopped"),
      Err(e) => error!(error = %e, "worker_stopped"),
    }
    result
  }

  async fn consume(&self, shutdown: &CancellationToken) -> Result<(), WorkerError> {
    let mut subscription = self
      .broker
      .subscribe(self.dispatcher.topic(), self.params.prefetch_count)
      .await?;

    let mut health = tokio::time::interval(self.params.health_check_interval());
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
          info!(in_flight = self.in_flight.count(), "shutdown_requested");
          return Ok(());
        }
        _ = health.tick() => self.check_zombies()?,
        delivery = subscription.next() => self.admit(delivery?),
      }
    }
  }

  /// Run one delivery on its own task. The message is acked whatever the
  /// business outcome.
  fn admit(&self, delivery: Delivery) {
    let guard = self.in_flight.begin();
    let dispatcher = self.dispatcher.clone();

    tokio::spawn(
      async move {
        let _guard = guard;
        let topic = delivery.message().topic.clone();
        let attempt = delivery.attempt();

        match dispatcher.dispatch(delivery.message()).await {
          Ok(disposition) => debug!(topic = %topic, ?disposition, "message_handled"),
          Err(e) if e.is_permanent() => {
            warn!(topic = %topic, attempt, error = %e, "message_rejected")
          }
          Err(e) => error!(topic = %topic, attempt, error = %e, "message_failed"),
        }

        if let Err(e) = delivery.ack().await {
          warn!(topic = %topic, error = %e, "ack_failed");
        }
      }
      .in_current_span(),
    );
  }

  fn check_zombies(&self) -> Result<(), WorkerError> {
    let stalled = self.in_flight.stalled(self.params.zombie_timeout());
    let max = self.params.max_zombie_count;
    if stalled > max {
      error!(alert = true, stalled, max, "zombie_ceiling_exceeded");
      return Err(WorkerError::ZombieCeiling { stalled, max });
    }
    if stalled > 0 {
      warn!(stalled, max, "zombie_tasks_detected");
    }
    Ok(())
  }

  /// Wait for every in-flight task to finish, alerting while it takes too long.
  async fn drain(&self) {
    let mut count = self.in_flight.subscribe();
    let started = Instant::now();
    let mut poll = tokio::time::interval(self.params.drain_poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(in_flight = *count.borrow(), "drain_started");
    loop {
      let remaining = *count.borrow_and_update();
      if remaining == 0 {
        break;
      }

      tokio::select! {
        changed = count.changed() => {
          if changed.is_err() {
            break;
          }
        }
        _ = poll.tick() => {
          let elapsed = started.elapsed();
          if elapsed >= self.params.drain_alert_after() {
            error!(
              alert = true,
              in_flight = remaining,
              elapsed_secs = elapsed.as_secs(),
              "drain_stuck"
            );
          }
        }
      }
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "drain_completed");
  }

  fn spawn_background(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    if let Some(finalizer) = &self.finalizer {
      let finalizer = finalizer.clone();
      let token = token.clone();
      tasks.push(tokio::spawn(
        async move { finalizer.run(token).await }.in_current_span(),
      ));
    }
    if let Some(sweeper) = &self.sweeper {
      let sweeper = sweeper.clone();
      let token = token.clone();
      tasks.push(tokio::spawn(
        async move { sweeper.run(token).await }.in_current_span(),
      ));
    }
    tasks
  }
}

