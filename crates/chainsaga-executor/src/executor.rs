//! The step state machine.

use std::collections::HashMap;
use std::sync::Arc;

use chainsaga_broker::Broker;
use chainsaga_graph::{StepConfig, StepGraph, StepKind, Transition, WorkflowKind};
use chainsaga_store::{
  CompletedStep, NewStep, NewWorkflow, PendingOperationTracker, StepCompletion, StepStatus,
  StoreError, Workflow, WorkflowMark, WorkflowStatus, WorkflowStep, WorkflowStore,
};
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::chain::ChainRegistry;
use crate::codes;
use crate::context::StepContext;
use crate::error::ExecutorError;
use crate::events::{ExecutionEvent, NoopNotifier, WorkflowNotifier};
use crate::handler::{HandlerRegistry, StepHandler, StepInput, StepOutcome};
use crate::message::{MessageStatus, StepMessage};

/// Retries allowed per step lineage unless configured otherwise.
pub const DEFAULT_MAX_STEP_RETRIES: i32 = 1;

/// Collaborators shared by every executor in a process.
#[derive(Clone)]
pub struct ExecutorDeps {
  pub store: Arc<dyn WorkflowStore>,
  pub tracker: Arc<dyn PendingOperationTracker>,
  pub broker: Arc<dyn Broker>,
  pub chains: Arc<ChainRegistry>,
  pub notifier: Arc<dyn WorkflowNotifier>,
  pub max_step_retries: i32,
}

impl ExecutorDeps {
  pub fn new(
    store: Arc<dyn WorkflowStore>,
    tracker: Arc<dyn PendingOperationTracker>,
    broker: Arc<dyn Broker>,
    chains: Arc<ChainRegistry>,
  ) -> Self {
    Self {
      store,
      tracker,
      broker,
      chains,
      notifier: Arc::new(NoopNotifier),
      max_step_retries: DEFAULT_MAX_STEP_RETRIES,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn WorkflowNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_max_step_retries(mut self, max_step_retries: i32) -> Self {
    self.max_step_retries = max_step_retries;
    self
  }
}

/// What handling one message did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
  /// The step reached a terminal status and its successors were scheduled.
  Completed { step_id: String, status: StepStatus },
  /// The step submitted a chain transaction and stays `processing`.
  AwaitingTransaction { step_id: String, tx_hash: String },
  /// The step was failed and the workflow rewound to `target`.
  Retried { step_id: String, target: StepKind },
  /// Redelivery or stale re-entry; nothing changed.
  Skipped { step_id: String, status: StepStatus },
}

/// Executes the steps of one workflow kind.
pub struct StepExecutor {
  graph: Arc<StepGraph>,
  handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
  deps: ExecutorDeps,
}

impl StepExecutor {
  /// Bind a graph to its handlers.
  ///
  /// Fails with [`ExecutorError::MissingHandler`] if any declared step has
  /// no registered handler.
  pub fn new(
    graph: StepGraph,
    registry: &HandlerRegistry,
    deps: ExecutorDeps,
  ) -> Result<Self, ExecutorError> {
    let mut handlers = HashMap::new();
    for kind in graph.kinds() {
      let name = graph.handler_name(kind.as_str());
      let handler = registry
        .get(name)
        .ok_or_else(|| ExecutorError::MissingHandler {
          workflow_kind: graph.kind().clone(),
          step_kind: kind.clone(),
          handler: name.to_string(),
        })?;
      handlers.insert(kind.clone(), handler);
    }

    Ok(Self {
      graph: Arc::new(graph),
      handlers,
      deps,
    })
  }

  pub fn graph(&self) -> &StepGraph {
    &self.graph
  }

  pub fn kind(&self) -> &WorkflowKind {
    self.graph.kind()
  }

  /// Create a workflow, insert its init step and publish it.
  #[instrument(name = "workflow_start", skip(self, params), fields(workflow_kind = %self.graph.kind()))]
  pub async fn start(
    &self,
    client_id: i64,
    chain_id: i64,
    params: serde_json::Value,
  ) -> Result<String, ExecutorError> {
    self.deps.chains.resolve(chain_id)?;

    let workflow_id = self
      .deps
      .store
      .create_workflow(NewWorkflow {
        kind: self.graph.kind().to_string(),
        client_id,
        chain_id,
        params: params.clone(),
      })
      .await?;

    let init = self.graph.init_kind().clone();
    self
      .deps
      .store
      .insert_step(NewStep::new(&workflow_id, init.as_str(), None, params.clone()))
      .await?;
    self
      .publish(StepMessage::queued(&workflow_id, init, None, params))
      .await?;

    info!(workflow_id = %workflow_id, client_id, chain_id, "workflow_started");
    self
      .notify(ExecutionEvent::WorkflowStarted {
        workflow_id: workflow_id.clone(),
        workflow_kind: self.graph.kind().clone(),
      })
      .await;

    Ok(workflow_id)
  }

  /// Handle one inbound step message.
  ///
  /// Business failures are persisted and routed, never returned. An `Err`
  /// is either a configuration mismatch or an infrastructure fault.
  #[instrument(
    name = "step_execute",
    skip(self, message),
    fields(
      workflow_kind = %self.graph.kind(),
      workflow_id = %message.workflow_id,
      step_kind = %message.step_kind,
      status = ?message.status,
    )
  )]
  pub async fn handle(&self, message: StepMessage) -> Result<Disposition, ExecutorError> {
    let Some(config) = self.graph.config(message.step_kind.as_str()) else {
      return Err(ExecutorError::UnknownStep {
        workflow_kind: self.graph.kind().clone(),
        step_kind: message.step_kind,
      });
    };

    let step = self
      .deps
      .store
      .find_step(
        &message.workflow_id,
        message.step_kind.as_str(),
        message.parent_step_id.as_deref(),
      )
      .await?
      .ok_or_else(|| ExecutorError::StepNotFound {
        workflow_id: message.workflow_id.clone(),
        step_kind: message.step_kind.clone(),
        parent_step_id: message.parent_step_id.clone(),
      })?;

    match message.status {
      MessageStatus::Queued => self.execute(step, config).await,
      MessageStatus::Done => {
        self
          .resume(step, StepStatus::Done, message.request_params)
          .await
      }
      MessageStatus::Failed => {
        self
          .resume(step, StepStatus::Failed, message.request_params)
          .await
      }
    }
  }

  pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, ExecutorError> {
    Ok(self.deps.store.get_workflow(workflow_id).await?)
  }

  pub async fn get_step(&self, step_id: &str) -> Result<WorkflowStep, ExecutorError> {
    Ok(self.deps.store.get_step(step_id).await?)
  }

  pub async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, ExecutorError> {
    Ok(self.deps.store.list_steps(workflow_id).await?)
  }

  async fn execute(
    &self,
    step: WorkflowStep,
    config: &StepConfig,
  ) -> Result<Disposition, ExecutorError> {
    let workflow = self.deps.store.get_workflow(&step.workflow_id).await?;
    let chain = self.deps.chains.resolve(workflow.chain_id)?;

    let request = match self.deps.store.begin_step(&step.id).await {
      Ok(request) => request,
      Err(StoreError::AlreadyProcessing { status, .. }) => {
        debug!(step_id = %step.id, %status, "step_already_processing");
        return Ok(Disposition::Skipped {
          step_id: step.id,
          status,
        });
      }
      Err(e) => return Err(e.into()),
    };

    let kind = StepKind::new(step.kind.clone());
    info!(step_id = %step.id, retry_count = step.retry_count, "step_started");
    self
      .notify(ExecutionEvent::StepStarted {
        workflow_id: workflow.id.clone(),
        step_id: step.id.clone(),
        step_kind: kind.clone(),
      })
      .await;

    let sources: Vec<&str> = self
      .graph
      .read_sources(kind.as_str())
      .iter()
      .map(StepKind::as_str)
      .collect();
    let ancestor_responses = self
      .deps
      .store
      .load_ancestor_responses(&step.id, &sources)
      .await?;

    let ctx = StepContext {
      workflow_id: workflow.id.clone(),
      workflow_kind: self.graph.kind().clone(),
      client_id: workflow.client_id,
      step_id: step.id.clone(),
      step_kind: kind.clone(),
      parent_step_id: step.parent_id.clone(),
      retry_count: step.retry_count,
      chain,
      tracker: self.deps.tracker.clone(),
    };
    let input = StepInput {
      params: request,
      ancestor_responses,
    };

    let outcome = self.invoke(&kind, ctx, input).await;
    skip_if_superseded(self.apply(&workflow, step, config, outcome).await)
  }

  /// Run the handler on its own task so a panic cannot take down the worker.
  async fn invoke(&self, kind: &StepKind, ctx: StepContext, input: StepInput) -> StepOutcome {
    let Some(handler) = self.handlers.get(kind).cloned() else {
      return StepOutcome::failed_with_code(
        codes::INTERNAL_ERROR,
        format!("no handler bound for step '{kind}'"),
      );
    };

    let task = tokio::spawn(async move { handler.handle(&ctx, input).await }.in_current_span());

    match task.await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(err)) => {
        warn!(error = %err, code = err.code(), "step_handler_error");
        StepOutcome::failed_with_code(err.code(), err.to_string())
      }
      Err(err) => {
        error!(error = %err, panicked = err.is_panic(), "step_handler_aborted");
        StepOutcome::failed_with_code(codes::INTERNAL_ERROR, "step handler aborted")
      }
    }
  }

  async fn apply(
    &self,
    workflow: &Workflow,
    step: WorkflowStep,
    config: &StepConfig,
    outcome: StepOutcome,
  ) -> Result<Disposition, ExecutorError> {
    match outcome {
      StepOutcome::Done { response } => {
        self
          .finish(workflow, step, StepStatus::Done, response)
          .await
      }
      StepOutcome::Failed { response } => {
        self
          .finish(workflow, step, StepStatus::Failed, response)
          .await
      }
      StepOutcome::Pending {
        response,
        tx_hash,
        retry_from_step_kind,
      } => {
        if let Some(target) = retry_from_step_kind {
          return self.retry(workflow, step, target, response).await;
        }

        if let Some(tx_hash) = tx_hash {
          self
            .deps
            .store
            .record_transaction(&step.id, &tx_hash)
            .await?;
          info!(step_id = %step.id, tx_hash = %tx_hash, "step_awaiting_transaction");
          return Ok(Disposition::AwaitingTransaction {
            step_id: step.id,
            tx_hash,
          });
        }

        if let Some(target) = config.retry_from.clone() {
          return self.retry(workflow, step, target, response).await;
        }

        warn!(step_id = %step.id, "step_pending_without_target");
        let response = codes::failure(
          codes::INVALID_PENDING_OUTCOME,
          "pending outcome without txHash or retry target",
        );
        self
          .finish(workflow, step, StepStatus::Failed, response)
          .await
      }
    }
  }

  /// Complete a step re-entered by the finalizer or the stale-step sweeper.
  async fn resume(
    &self,
    step: WorkflowStep,
    status: StepStatus,
    response: serde_json::Value,
  ) -> Result<Disposition, ExecutorError> {
    if step.status != StepStatus::Processing {
      debug!(step_id = %step.id, current = %step.status, "stale_reentry");
      return Ok(Disposition::Skipped {
        step_id: step.id,
        status: step.status,
      });
    }

    let workflow = self.deps.store.get_workflow(&step.workflow_id).await?;
    skip_if_superseded(self.finish(&workflow, step, status, response).await)
  }

  async fn finish(
    &self,
    workflow: &Workflow,
    step: WorkflowStep,
    status: StepStatus,
    response: serde_json::Value,
  ) -> Result<Disposition, ExecutorError> {
    let transition = match status {
      StepStatus::Done => Transition::Success,
      _ => Transition::Failure,
    };
    let completion = self.successors(
      workflow,
      &step,
      transition,
      StepCompletion::new(status, response.clone()),
    );
    let completed = self.deps.store.complete_step(&step.id, completion).await?;

    info!(step_id = %step.id, %status, "step_completed");
    self
      .notify(ExecutionEvent::StepCompleted {
        workflow_id: workflow.id.clone(),
        step_id: step.id.clone(),
        step_kind: StepKind::new(step.kind.clone()),
        status,
        response,
      })
      .await;

    self.publish_successors(workflow, &step, completed).await?;
    Ok(Disposition::Completed {
      step_id: step.id,
      status,
    })
  }

  /// Fail the step and rewind the workflow to the nearest `target` ancestor.
  async fn retry(
    &self,
    workflow: &Workflow,
    step: WorkflowStep,
    target: StepKind,
    response: serde_json::Value,
  ) -> Result<Disposition, ExecutorError> {
    let max = self.deps.max_step_retries;
    if step.retry_count >= max {
      warn!(step_id = %step.id, retry_count = step.retry_count, max, "step_retry_limit_exceeded");
      let response = codes::failure(
        codes::RETRY_LIMIT_EXCEEDED,
        format!(
          "step '{}' already retried {} time(s)",
          step.kind, step.retry_count
        ),
      );
      return self
        .finish(workflow, step, StepStatus::Failed, response)
        .await;
    }

    let target_step = if self.graph.contains(target.as_str()) {
      self
        .deps
        .store
        .find_ancestor(&step.id, target.as_str())
        .await?
    } else {
      None
    };
    let Some(target_step) = target_step else {
      warn!(step_id = %step.id, target = %target, "step_invalid_retry_target");
      let response = codes::failure(
        codes::INVALID_RETRY_TARGET,
        format!("'{target}' is not an earlier step of '{}'", step.kind),
      );
      return self
        .finish(workflow, step, StepStatus::Failed, response)
        .await;
    };

    let rewind = NewStep::new(
      &workflow.id,
      target.as_str(),
      Some(step.id.clone()),
      target_step.request_params.0,
    )
    .with_retry_count(step.retry_count + 1);
    let completion = StepCompletion::retried(response.clone()).with_successor(rewind);
    let completed = self.deps.store.complete_step(&step.id, completion).await?;

    self
      .notify(ExecutionEvent::StepCompleted {
        workflow_id: workflow.id.clone(),
        step_id: step.id.clone(),
        step_kind: StepKind::new(step.kind.clone()),
        status: StepStatus::Failed,
        response,
      })
      .await;

    let retry_count = completed.retry_count;
    self.publish_successors(workflow, &step, completed).await?;

    info!(step_id = %step.id, target = %target, retry_count, "step_retried");
    Ok(Disposition::Retried {
      step_id: step.id,
      target,
    })
  }

  /// Add the successors of `step` for `transition` to `completion`.
  fn successors(
    &self,
    workflow: &Workflow,
    step: &WorkflowStep,
    transition: Transition,
    mut completion: StepCompletion,
  ) -> StepCompletion {
    for next in self.graph.next(&step.kind, transition) {
      if next.is_absorbing() {
        let status = if next.as_str() == StepKind::MARK_SUCCESS {
          WorkflowStatus::Completed
        } else {
          WorkflowStatus::Failed
        };
        let terminal = NewStep::new(
          &workflow.id,
          next.as_str(),
          Some(step.id.clone()),
          serde_json::json!({}),
        )
        .with_retry_count(step.retry_count);
        completion = completion.with_terminal(terminal, status);
        continue;
      }

      let successor = NewStep::new(
        &workflow.id,
        next.as_str(),
        Some(step.id.clone()),
        workflow.params.0.clone(),
      )
      .with_retry_count(step.retry_count);
      completion = completion.with_successor(successor);
    }
    completion
  }

  /// Publish the successors a completion left `queued` and report the
  /// terminal workflow transition, if any.
  ///
  /// A successor whose publish fails stays `queued`; the stale-step sweeper
  /// republishes it.
  async fn publish_successors(
    &self,
    workflow: &Workflow,
    step: &WorkflowStep,
    completed: CompletedStep,
  ) -> Result<(), ExecutorError> {
    match completed.workflow {
      Some(WorkflowMark::Changed(status)) => self.report_terminal(workflow, step, status).await,
      Some(WorkflowMark::Unchanged(status)) => {
        debug!(workflow_id = %workflow.id, %status, "workflow_already_marked")
      }
      Some(WorkflowMark::Conflict { current, requested }) => error!(
        workflow_id = %workflow.id,
        %current,
        %requested,
        "workflow_status_conflict"
      ),
      None => {}
    }

    for next in completed.queued {
      debug!(step_id = %next.id, next_kind = %next.kind, "step_scheduled");
      self
        .publish(StepMessage::queued(
          &workflow.id,
          StepKind::new(next.kind),
          next.parent_id,
          next.request_params.0,
        ))
        .await?;
    }
    Ok(())
  }

  async fn report_terminal(
    &self,
    workflow: &Workflow,
    step: &WorkflowStep,
    status: WorkflowStatus,
  ) {
    let workflow_kind = self.graph.kind().clone();
    if status == WorkflowStatus::Completed {
      info!(workflow_id = %workflow.id, "workflow_completed");
      self
        .notify(ExecutionEvent::WorkflowCompleted {
          workflow_id: workflow.id.clone(),
          workflow_kind,
        })
        .await;
    } else {
      warn!(workflow_id = %workflow.id, failed_step = %step.kind, "workflow_failed");
      self
        .notify(ExecutionEvent::WorkflowFailed {
          workflow_id: workflow.id.clone(),
          workflow_kind,
        })
        .await;
    }
  }

  async fn publish(&self, message: StepMessage) -> Result<(), ExecutorError> {
    let message = message.to_broker(self.graph.kind())?;
    self.deps.broker.publish(message).await?;
    Ok(())
  }

  async fn notify(&self, event: ExecutionEvent) {
    self.deps.notifier.notify(event).await;
  }
}

/// A step completed by someone else in the meantime (a re-entry racing the
/// stale-step sweeper, or a late handler) is not an error.
fn skip_if_superseded(
  result: Result<Disposition, ExecutorError>,
) -> Result<Disposition, ExecutorError> {
  match result {
    Err(ExecutorError::Store(StoreError::InvalidTransition { step_id, from, .. })) => {
      debug!(step_id = %step_id, current = %from, "step_superseded");
      Ok(Disposition::Skipped {
        step_id,
        status: from,
      })
    }
    other => other,
  }
}
