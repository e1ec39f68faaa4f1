use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use sqlx::types::Json;
use tracing::debug;

use crate::{
  CompletedStep, NewStep, NewWorkflow, PendingOperation, PendingOperationTracker, StepCompletion,
  StepStatus, StoreError, WorkerRegistration, WorkerRegistry, Workflow, WorkflowMark,
  WorkflowStatus, WorkflowStep, WorkflowStore,
};

/// SQLite-based store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open a pool for `url`, creating the database file if needed.
  ///
  /// In-memory databases are pinned to a single long-lived connection so the
  /// database survives for the lifetime of the pool.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let mut pool_options = SqlitePoolOptions::new();
    if url.contains(":memory:") || url.contains("mode=memory") {
      pool_options = pool_options
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  /// The underlying pool, shared with the durable broker.
  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
  match err {
    sqlx::Error::Database(db) => db.is_unique_violation(),
    _ => false,
  }
}

/// Insert a step unless its dedup key exists. Returns whether a row was added.
async fn insert_step_if_absent(
  conn: &mut SqliteConnection,
  step: &NewStep,
  status: StepStatus,
  response: Option<&serde_json::Value>,
  now: DateTime<Utc>,
) -> Result<bool, StoreError> {
  let result = sqlx::query(
    r#"
          INSERT OR IGNORE INTO workflow_steps
              (id, workflow_id, kind, parent_id, status, request_params, response_data,
               retry_count, created_at, updated_at)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
          "#,
  )
  .bind(uuid::Uuid::new_v4().to_string())
  .bind(&step.workflow_id)
  .bind(&step.kind)
  .bind(&step.parent_id)
  .bind(status)
  .bind(Json(&step.request))
  .bind(response.map(Json))
  .bind(step.retry_count)
  .bind(now)
  .bind(now)
  .execute(&mut *conn)
  .await?;

  Ok(result.rows_affected() > 0)
}

async fn find_step_in(
  conn: &mut SqliteConnection,
  workflow_id: &str,
  kind: &str,
  parent_id: Option<&str>,
) -> Result<Option<WorkflowStep>, StoreError> {
  let step = sqlx::query_as(
    r#"
          SELECT id, workflow_id, kind, parent_id, status, request_params, response_data,
                 retry_count, transaction_hash, created_at, updated_at
          FROM workflow_steps
          WHERE workflow_id = ? AND kind = ? AND IFNULL(parent_id, '') = IFNULL(?, '')
          "#,
  )
  .bind(workflow_id)
  .bind(kind)
  .bind(parent_id)
  .fetch_optional(&mut *conn)
  .await?;

  Ok(step)
}

async fn mark_workflow_in(
  conn: &mut SqliteConnection,
  workflow_id: &str,
  status: WorkflowStatus,
  now: DateTime<Utc>,
) -> Result<WorkflowMark, StoreError> {
  if !status.is_terminal() {
    return Err(StoreError::NotTerminal(status));
  }

  let result = sqlx::query(
    r#"
          UPDATE workflows
          SET status = ?, updated_at = ?
          WHERE id = ? AND status IN ('queued', 'in_progress')
          "#,
  )
  .bind(status)
  .bind(now)
  .bind(workflow_id)
  .execute(&mut *conn)
  .await?;

  if result.rows_affected() > 0 {
    return Ok(WorkflowMark::Changed(status));
  }

  let current: WorkflowStatus = sqlx::query_scalar("SELECT status FROM workflows WHERE id = ?")
    .bind(workflow_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;

  if current == status {
    Ok(WorkflowMark::Unchanged(status))
  } else {
    Ok(WorkflowMark::Conflict {
      current,
      requested: status,
    })
  }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
  async fn create_workflow(&self, workflow: NewWorkflow) -> Result<String, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
      r#"
            INSERT INTO workflows (id, kind, status, client_id, chain_id, params, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&id)
    .bind(&workflow.kind)
    .bind(WorkflowStatus::Queued)
    .bind(workflow.client_id)
    .bind(workflow.chain_id)
    .bind(Json(&workflow.params))
    .bind(now)
    .bind(now)
    .execute(&self.pool)
    .await?;

    debug!(workflow_id = %id, kind = %workflow.kind, "workflow_created");
    Ok(id)
  }

  async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, StoreError> {
    sqlx::query_as(
      r#"
            SELECT id, kind, status, client_id, chain_id, params, created_at, updated_at
            FROM workflows
            WHERE id = ?
            "#,
    )
    .bind(workflow_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::not_found("workflow", workflow_id))
  }

  async fn insert_step(&self, step: NewStep) -> Result<String, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();

    let result = sqlx::query(
      r#"
            INSERT INTO workflow_steps
                (id, workflow_id, kind, parent_id, status, request_params, retry_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&id)
    .bind(&step.workflow_id)
    .bind(&step.kind)
    .bind(&step.parent_id)
    .bind(StepStatus::Queued)
    .bind(Json(&step.request))
    .bind(step.retry_count)
    .bind(now)
    .bind(now)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(id),
      Err(err) if is_unique_violation(&err) => Err(StoreError::DuplicateStep {
        workflow_id: step.workflow_id,
        kind: step.kind,
        parent_id: step.parent_id,
      }),
      Err(err) => Err(err.into()),
    }
  }

  async fn get_step(&self, step_id: &str) -> Result<WorkflowStep, StoreError> {
    sqlx::query_as(
      r#"
            SELECT id, workflow_id, kind, parent_id, status, request_params, response_data,
                   retry_count, transaction_hash, created_at, updated_at
            FROM workflow_steps
            WHERE id = ?
            "#,
    )
    .bind(step_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::not_found("step", step_id))
  }

  async fn find_step(
    &self,
    workflow_id: &str,
    kind: &str,
    parent_id: Option<&str>,
  ) -> Result<Option<WorkflowStep>, StoreError> {
    let mut conn = self.pool.acquire().await?;
    find_step_in(&mut *conn, workflow_id, kind, parent_id).await
  }

  async fn find_ancestor(
    &self,
    step_id: &str,
    kind: &str,
  ) -> Result<Option<WorkflowStep>, StoreError> {
    let step = sqlx::query_as(
      r#"
            WITH RECURSIVE ancestors (id, parent_id, depth) AS (
                SELECT id, parent_id, 0
                FROM workflow_steps
                WHERE id = ?
                UNION ALL
                SELECT s.id, s.parent_id, a.depth + 1
                FROM workflow_steps s
                JOIN ancestors a ON s.id = a.parent_id
            )
            SELECT s.id, s.workflow_id, s.kind, s.parent_id, s.status, s.request_params,
                   s.response_data, s.retry_count, s.transaction_hash, s.created_at, s.updated_at
            FROM ancestors a
            JOIN workflow_steps s ON s.id = a.id
            WHERE a.depth > 0 AND s.kind = ?
            ORDER BY a.depth ASC
            LIMIT 1
            "#,
    )
    .bind(step_id)
    .bind(kind)
    .fetch_optional(&self.pool)
    .await?;

    Ok(step)
  }

  async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, StoreError> {
    let steps = sqlx::query_as(
      r#"
            SELECT id, workflow_id, kind, parent_id, status, request_params, response_data,
                   retry_count, transaction_hash, created_at, updated_at
            FROM workflow_steps
            WHERE workflow_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
    )
    .bind(workflow_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(steps)
  }

  async fn begin_step(&self, step_id: &str) -> Result<serde_json::Value, StoreError> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    let claimed: Option<(String, Json<serde_json::Value>)> = sqlx::query_as(
      r#"
            UPDATE workflow_steps
            SET status = 'processing', updated_at = ?
            WHERE id = ? AND status = 'queued'
            RETURNING workflow_id, request_params
            "#,
    )
    .bind(now)
    .bind(step_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((workflow_id, Json(request))) = claimed else {
      // Release the connection before reading the current state.
      tx.rollback().await?;
      let step = self.get_step(step_id).await?;
      return Err(StoreError::AlreadyProcessing {
        step_id: step_id.to_string(),
        status: step.status,
      });
    };

    sqlx::query(
      r#"
            UPDATE workflows
            SET status = 'in_progress', updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
    )
    .bind(now)
    .bind(&workflow_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(request)
  }

  async fn complete_step(
    &self,
    step_id: &str,
    completion: StepCompletion,
  ) -> Result<CompletedStep, StoreError> {
    if !completion.status.is_terminal() {
      return Err(StoreError::InvalidTransition {
        step_id: step_id.to_string(),
        from: StepStatus::Processing,
        to: completion.status,
      });
    }

    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    let completed: Option<(String, i32)> = sqlx::query_as(
      r#"
            UPDATE workflow_steps
            SET status = ?, response_data = ?, retry_count = retry_count + ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            RETURNING workflow_id, retry_count
            "#,
    )
    .bind(completion.status)
    .bind(Json(&completion.response))
    .bind(i32::from(completion.retry))
    .bind(now)
    .bind(step_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((workflow_id, retry_count)) = completed else {
      tx.rollback().await?;
      let step = self.get_step(step_id).await?;
      return Err(StoreError::InvalidTransition {
        step_id: step_id.to_string(),
        from: step.status,
        to: completion.status,
      });
    };

    let mut queued = Vec::new();
    for successor in &completion.successors {
      if !insert_step_if_absent(&mut *tx, successor, StepStatus::Queued, None, now).await? {
        debug!(step_id, kind = %successor.kind, "successor_already_exists");
      }
      let row = find_step_in(
        &mut *tx,
        &successor.workflow_id,
        &successor.kind,
        successor.parent_id.as_deref(),
      )
      .await?;
      if let Some(row) = row.filter(|row| row.status == StepStatus::Queued) {
        queued.push(row);
      }
    }

    let empty = serde_json::json!({});
    for absorbed in &completion.absorbed {
      insert_step_if_absent(&mut *tx, absorbed, StepStatus::Done, Some(&empty), now).await?;
    }

    let workflow = match completion.workflow_status {
      Some(status) => Some(mark_workflow_in(&mut *tx, &workflow_id, status, now).await?),
      None => None,
    };

    tx.commit().await?;
    Ok(CompletedStep {
      retry_count,
      queued,
      workflow,
    })
  }

  async fn record_transaction(&self, step_id: &str, tx_hash: &str) -> Result<(), StoreError> {
    let result = sqlx::query(
      r#"
            UPDATE workflow_steps
            SET transaction_hash = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
    )
    .bind(tx_hash)
    .bind(Utc::now())
    .bind(step_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      let step = self.get_step(step_id).await?;
      return Err(StoreError::InvalidTransition {
        step_id: step_id.to_string(),
        from: step.status,
        to: StepStatus::Processing,
      });
    }

    Ok(())
  }

  async fn load_ancestor_responses(
    &self,
    step_id: &str,
    kinds: &[&str],
  ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
    if kinds.is_empty() {
      return Ok(HashMap::new());
    }

    let chain: Vec<(String, Option<Json<serde_json::Value>>)> = sqlx::query_as(
      r#"
            WITH RECURSIVE ancestors (id, kind, parent_id, response_data, depth) AS (
                SELECT id, kind, parent_id, response_data, 0
                FROM workflow_steps
                WHERE id = ?
                UNION ALL
                SELECT s.id, s.kind, s.parent_id, s.response_data, a.depth + 1
                FROM workflow_steps s
                JOIN ancestors a ON s.id = a.parent_id
            )
            SELECT kind, response_data
            FROM ancestors
            WHERE depth > 0
            ORDER BY depth ASC
            "#,
    )
    .bind(step_id)
    .fetch_all(&self.pool)
    .await?;

    let mut responses = HashMap::new();
    for (kind, response) in chain {
      if !kinds.contains(&kind.as_str()) || responses.contains_key(&kind) {
        continue;
      }
      if let Some(Json(response)) = response {
        responses.insert(kind, response);
      }
    }

    Ok(responses)
  }

  async fn mark_workflow(
    &self,
    workflow_id: &str,
    status: WorkflowStatus,
  ) -> Result<bool, StoreError> {
    let mut conn = self.pool.acquire().await?;
    match mark_workflow_in(&mut *conn, workflow_id, status, Utc::now()).await? {
      WorkflowMark::Changed(_) => Ok(true),
      WorkflowMark::Unchanged(_) => Ok(false),
      WorkflowMark::Conflict { current, requested } => Err(StoreError::ConflictingStatus {
        workflow_id: workflow_id.to_string(),
        current,
        requested,
      }),
    }
  }

  async fn claim_stale_steps(
    &self,
    before: DateTime<Utc>,
  ) -> Result<Vec<WorkflowStep>, StoreError> {
    let steps = sqlx::query_as(
      r#"
            UPDATE workflow_steps
            SET updated_at = ?
            WHERE status = 'processing' AND transaction_hash IS NULL AND updated_at < ?
            RETURNING id, workflow_id, kind, parent_id, status, request_params, response_data,
                      retry_count, transaction_hash, created_at, updated_at
            "#,
    )
    .bind(Utc::now())
    .bind(before)
    .fetch_all(&self.pool)
    .await?;

    Ok(steps)
  }

  async fn claim_idle_queued_steps(
    &self,
    before: DateTime<Utc>,
  ) -> Result<Vec<WorkflowStep>, StoreError> {
    let steps = sqlx::query_as(
      r#"
            UPDATE workflow_steps
            SET updated_at = ?
            WHERE status = 'queued' AND updated_at < ?
            RETURNING id, workflow_id, kind, parent_id, status, request_params, response_data,
                      retry_count, transaction_hash, created_at, updated_at
            "#,
    )
    .bind(Utc::now())
    .bind(before)
    .fetch_all(&self.pool)
    .await?;

    Ok(steps)
  }
}

#[async_trait]
impl WorkerRegistry for SqliteStore {
  async fn register(
    &self,
    worker_id: i64,
    kind: &str,
    params: &serde_json::Value,
  ) -> Result<WorkerRegistration, StoreError> {
    let registration = sqlx::query_as(
      r#"
            INSERT INTO cron_processes (id, kind, status, params_json)
            VALUES (?, ?, 'stopped', ?)
            ON CONFLICT (id) DO UPDATE SET kind = excluded.kind, params_json = excluded.params_json
            RETURNING id, kind, status, params_json, last_started_at, last_ended_at
            "#,
    )
    .bind(worker_id)
    .bind(kind)
    .bind(Json(params))
    .fetch_one(&self.pool)
    .await?;

    Ok(registration)
  }

  async fn get_worker(&self, worker_id: i64) -> Result<WorkerRegistration, StoreError> {
    sqlx::query_as(
      r#"
            SELECT id, kind, status, params_json, last_started_at, last_ended_at
            FROM cron_processes
            WHERE id = ?
            "#,
    )
    .bind(worker_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::not_found("worker", worker_id.to_string()))
  }

  async fn claim(&self, worker_id: i64) -> Result<WorkerRegistration, StoreError> {
    let claimed = sqlx::query_as(
      r#"
            UPDATE cron_processes
            SET status = 'running', last_started_at = ?
            WHERE id = ? AND status = 'stopped'
            RETURNING id, kind, status, params_json, last_started_at, last_ended_at
            "#,
    )
    .bind(Utc::now())
    .bind(worker_id)
    .fetch_optional(&self.pool)
    .await?;

    match claimed {
      Some(registration) => Ok(registration),
      None => {
        self.get_worker(worker_id).await?;
        Err(StoreError::AlreadyRunning { worker_id })
      }
    }
  }

  async fn release(&self, worker_id: i64) -> Result<(), StoreError> {
    let result = sqlx::query(
      r#"
            UPDATE cron_processes
            SET status = 'stopped', last_ended_at = ?
            WHERE id = ? AND status = 'running'
            "#,
    )
    .bind(Utc::now())
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      self.get_worker(worker_id).await?;
      return Err(StoreError::NotRunning { worker_id });
    }

    Ok(())
  }
}

#[async_trait]
impl PendingOperationTracker for SqliteStore {
  async fn record(&self, operation: &PendingOperation) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO pending_operations
                (transaction_uuid, chain_id, tx_hash, raw_transaction, after_completion, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (transaction_uuid) DO UPDATE SET
                tx_hash = excluded.tx_hash,
                raw_transaction = excluded.raw_transaction,
                after_completion = excluded.after_completion
            "#,
    )
    .bind(&operation.transaction_uuid)
    .bind(operation.chain_id)
    .bind(&operation.tx_hash)
    .bind(&operation.raw_transaction)
    .bind(&operation.after_completion)
    .bind(operation.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_operation(&self, transaction_uuid: &str) -> Result<PendingOperation, StoreError> {
    sqlx::query_as(
      r#"
            SELECT transaction_uuid, chain_id, tx_hash, raw_transaction, after_completion, created_at
            FROM pending_operations
            WHERE transaction_uuid = ?
            "#,
    )
    .bind(transaction_uuid)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::not_found("pending operation", transaction_uuid))
  }

  async fn list_operations(
    &self,
    chain_id: i64,
    limit: i64,
  ) -> Result<Vec<PendingOperation>, StoreError> {
    let operations = sqlx::query_as(
      r#"
            SELECT transaction_uuid, chain_id, tx_hash, raw_transaction, after_completion, created_at
            FROM pending_operations
            WHERE chain_id = ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
    )
    .bind(chain_id)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    Ok(operations)
  }

  async fn remove(&self, transaction_uuid: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM pending_operations WHERE transaction_uuid = ?")
      .bind(transaction_uuid)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected() > 0)
  }
}
