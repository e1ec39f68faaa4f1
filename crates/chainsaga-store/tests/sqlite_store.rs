use std::sync::Arc;

use chainsaga_store::{
  NewStep, NewWorkflow, PendingOperation, PendingOperationTracker, SqliteStore, StepCompletion,
  StepStatus, StoreError, WorkerRegistry, WorkerStatus, WorkflowMark, WorkflowStatus,
  WorkflowStore,
};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::types::Json;

async fn memory_store() -> SqliteStore {
  let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
  store.migrate().await.unwrap();
  store
}

async fn workflow(store: &SqliteStore) -> String {
  store
    .create_workflow(NewWorkflow {
      kind: "mint".to_string(),
      client_id: 7,
      chain_id: 1,
      params: json!({ "amount": 10 }),
    })
    .await
    .unwrap()
}

async fn done_step(
  store: &SqliteStore,
  workflow_id: &str,
  kind: &str,
  parent: Option<&str>,
  response: serde_json::Value,
) -> String {
  let id = store
    .insert_step(NewStep::new(
      workflow_id,
      kind,
      parent.map(str::to_string),
      json!({}),
    ))
    .await
    .unwrap();
  store.begin_step(&id).await.unwrap();
  store
    .complete_step(&id, StepCompletion::new(StepStatus::Done, response))
    .await
    .unwrap();
  id
}

#[tokio::test]
async fn test_create_workflow_starts_queued() {
  let store = memory_store().await;
  let id = workflow(&store).await;

  let workflow = store.get_workflow(&id).await.unwrap();
  assert_eq!(workflow.status, WorkflowStatus::Queued);
  assert_eq!(workflow.client_id, 7);
  assert_eq!(workflow.params.0, json!({ "amount": 10 }));
}

#[tokio::test]
async fn test_missing_workflow_is_not_found() {
  let store = memory_store().await;
  let err = store.get_workflow("nope").await.unwrap_err();
  assert!(matches!(err, StoreError::NotFound { entity: "workflow", .. }));
}

#[tokio::test]
async fn test_duplicate_step_is_rejected() {
  let store = memory_store().await;
  let wf = workflow(&store).await;

  store
    .insert_step(NewStep::new(&wf, "init", None, json!({})))
    .await
    .unwrap();
  let err = store
    .insert_step(NewStep::new(&wf, "init", None, json!({})))
    .await
    .unwrap_err();

  assert!(matches!(err, StoreError::DuplicateStep { .. }));
}

#[tokio::test]
async fn test_same_kind_under_different_parents_is_allowed() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let a = done_step(&store, &wf, "a", None, json!({})).await;
  let b = done_step(&store, &wf, "b", None, json!({})).await;

  store
    .insert_step(NewStep::new(&wf, "join", Some(a.clone()), json!({})))
    .await
    .unwrap();
  store
    .insert_step(NewStep::new(&wf, "join", Some(b), json!({})))
    .await
    .unwrap();

  let found = store.find_step(&wf, "join", Some(&a)).await.unwrap();
  assert_eq!(found.unwrap().parent_id.as_deref(), Some(a.as_str()));
}

#[tokio::test]
async fn test_begin_step_moves_workflow_in_progress() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let step = store
    .insert_step(NewStep::new(&wf, "init", None, json!({ "to": "0xabc" })))
    .await
    .unwrap();

  let request = store.begin_step(&step).await.unwrap();
  assert_eq!(request, json!({ "to": "0xabc" }));
  assert_eq!(
    store.get_step(&step).await.unwrap().status,
    StepStatus::Processing
  );
  assert_eq!(
    store.get_workflow(&wf).await.unwrap().status,
    WorkflowStatus::InProgress
  );

  let err = store.begin_step(&step).await.unwrap_err();
  assert!(matches!(
    err,
    StoreError::AlreadyProcessing {
      status: StepStatus::Processing,
      ..
    }
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_begin_step_has_one_winner() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
  let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
  store.migrate().await.unwrap();

  let wf = workflow(&store).await;
  let step = store
    .insert_step(NewStep::new(&wf, "init", None, json!({})))
    .await
    .unwrap();

  let attempts = (0..2).map(|_| {
    let store = store.clone();
    let step = step.clone();
    tokio::spawn(async move { store.begin_step(&step).await })
  });
  let results = futures::future::join_all(attempts).await;

  let mut won = 0;
  let mut lost = 0;
  for result in results {
    match result.unwrap() {
      Ok(_) => won += 1,
      Err(StoreError::AlreadyProcessing { .. }) => lost += 1,
      Err(other) => panic!("unexpected error: {other}"),
    }
  }
  assert_eq!((won, lost), (1, 1));
}

#[tokio::test]
async fn test_complete_step_requires_processing() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let step = store
    .insert_step(NewStep::new(&wf, "init", None, json!({})))
    .await
    .unwrap();

  let err = store
    .complete_step(
      &step,
      StepCompletion::new(StepStatus::Done, json!({}))
        .with_successor(NewStep::new(&wf, "a", Some(step.clone()), json!({}))),
    )
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    StoreError::InvalidTransition {
      from: StepStatus::Queued,
      ..
    }
  ));

  // A rejected completion writes no successors.
  assert_eq!(store.list_steps(&wf).await.unwrap().len(), 1);

  store.begin_step(&step).await.unwrap();
  store
    .complete_step(
      &step,
      StepCompletion::new(StepStatus::Failed, json!({ "code": "BOOM" })),
    )
    .await
    .unwrap();

  let stored = store.get_step(&step).await.unwrap();
  assert_eq!(stored.status, StepStatus::Failed);
  assert_eq!(stored.response_data, Some(Json(json!({ "code": "BOOM" }))));
}

#[tokio::test]
async fn test_retried_completion_increments_count() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let step = store
    .insert_step(NewStep::new(&wf, "prove", None, json!({})).with_retry_count(0))
    .await
    .unwrap();
  store.begin_step(&step).await.unwrap();

  let completed = store
    .complete_step(
      &step,
      StepCompletion::retried(json!({ "retry": true }))
        .with_successor(NewStep::new(&wf, "init", Some(step.clone()), json!({})).with_retry_count(1)),
    )
    .await
    .unwrap();
  assert_eq!(completed.retry_count, 1);
  assert_eq!(completed.queued.len(), 1);
  assert_eq!(completed.queued[0].retry_count, 1);

  let stored = store.get_step(&step).await.unwrap();
  assert_eq!(stored.status, StepStatus::Failed);
  assert_eq!(stored.retry_count, 1);
}

#[tokio::test]
async fn test_complete_step_commits_successors_and_terminal_status() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let init = done_step(&store, &wf, "init", None, json!({})).await;
  let a = store
    .insert_step(NewStep::new(&wf, "a", Some(init.clone()), json!({})))
    .await
    .unwrap();
  store.begin_step(&a).await.unwrap();

  // `b` already exists and is still queued; `c` is new.
  store
    .insert_step(NewStep::new(&wf, "b", Some(a.clone()), json!({ "kept": true })))
    .await
    .unwrap();
  let completed = store
    .complete_step(
      &a,
      StepCompletion::new(StepStatus::Done, json!({ "ok": true }))
        .with_successor(NewStep::new(&wf, "b", Some(a.clone()), json!({})))
        .with_successor(NewStep::new(&wf, "c", Some(a.clone()), json!({})))
        .with_terminal(
          NewStep::new(&wf, "markSuccess", Some(a.clone()), json!({})),
          WorkflowStatus::Completed,
        ),
    )
    .await
    .unwrap();

  let queued: Vec<&str> = completed.queued.iter().map(|s| s.kind.as_str()).collect();
  assert_eq!(queued, vec!["b", "c"]);
  assert_eq!(completed.queued[0].request_params.0, json!({ "kept": true }));
  assert_eq!(
    completed.workflow,
    Some(WorkflowMark::Changed(WorkflowStatus::Completed))
  );

  let terminal = store
    .find_step(&wf, "markSuccess", Some(&a))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(terminal.status, StepStatus::Done);
  assert_eq!(
    store.get_workflow(&wf).await.unwrap().status,
    WorkflowStatus::Completed
  );
}

#[tokio::test]
async fn test_conflicting_terminal_status_keeps_the_step() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  store
    .mark_workflow(&wf, WorkflowStatus::Completed)
    .await
    .unwrap();
  let step = store
    .insert_step(NewStep::new(&wf, "late", None, json!({})))
    .await
    .unwrap();
  store.begin_step(&step).await.unwrap();

  let completed = store
    .complete_step(
      &step,
      StepCompletion::new(StepStatus::Failed, json!({})).with_terminal(
        NewStep::new(&wf, "markFailure", Some(step.clone()), json!({})),
        WorkflowStatus::Failed,
      ),
    )
    .await
    .unwrap();

  assert_eq!(
    completed.workflow,
    Some(WorkflowMark::Conflict {
      current: WorkflowStatus::Completed,
      requested: WorkflowStatus::Failed,
    })
  );
  assert_eq!(
    store.get_step(&step).await.unwrap().status,
    StepStatus::Failed
  );
}

#[tokio::test]
async fn test_record_transaction_and_stale_claiming() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let with_hash = store
    .insert_step(NewStep::new(&wf, "deploy", None, json!({})))
    .await
    .unwrap();
  let without_hash = store
    .insert_step(NewStep::new(&wf, "stake", None, json!({})))
    .await
    .unwrap();
  store.begin_step(&with_hash).await.unwrap();
  store.begin_step(&without_hash).await.unwrap();
  store.record_transaction(&with_hash, "0xfeed").await.unwrap();

  let fresh = store
    .claim_stale_steps(Utc::now() - Duration::hours(1))
    .await
    .unwrap();
  assert!(fresh.is_empty());

  let stale = store
    .claim_stale_steps(Utc::now() + Duration::seconds(1))
    .await
    .unwrap();
  assert_eq!(stale.len(), 1);
  assert_eq!(stale[0].id, without_hash);

  // Claiming stamped the row; it is not idle before the same cutoff again.
  let cutoff = stale[0].updated_at;
  assert!(store.claim_stale_steps(cutoff).await.unwrap().is_empty());

  assert_eq!(
    store
      .get_step(&with_hash)
      .await
      .unwrap()
      .transaction_hash
      .as_deref(),
    Some("0xfeed")
  );
}

#[tokio::test]
async fn test_ancestor_responses_follow_parent_chain() {
  let store = memory_store().await;
  let wf = workflow(&store).await;

  let init = done_step(&store, &wf, "init", None, json!({ "from": "init" })).await;
  let a = done_step(&store, &wf, "a", Some(&init), json!({ "from": "a" })).await;
  // Sibling of `a` under the same parent, never visible to a's descendants.
  done_step(&store, &wf, "sibling", Some(&init), json!({ "from": "sibling" })).await;
  let b = store
    .insert_step(NewStep::new(&wf, "b", Some(a.clone()), json!({})))
    .await
    .unwrap();

  let responses = store
    .load_ancestor_responses(&b, &["a", "init", "sibling"])
    .await
    .unwrap();

  assert_eq!(responses.len(), 2);
  assert_eq!(responses["a"], json!({ "from": "a" }));
  assert_eq!(responses["init"], json!({ "from": "init" }));
  assert!(!responses.contains_key("sibling"));
}

#[tokio::test]
async fn test_ancestor_responses_prefer_nearest() {
  let store = memory_store().await;
  let wf = workflow(&store).await;

  let first = done_step(&store, &wf, "init", None, json!({ "attempt": 1 })).await;
  let retry = done_step(&store, &wf, "prove", Some(&first), json!({})).await;
  let second = done_step(&store, &wf, "init", Some(&retry), json!({ "attempt": 2 })).await;
  let next = store
    .insert_step(NewStep::new(&wf, "prove", Some(second), json!({})))
    .await
    .unwrap();

  let responses = store
    .load_ancestor_responses(&next, &["init"])
    .await
    .unwrap();
  assert_eq!(responses["init"], json!({ "attempt": 2 }));
}

#[tokio::test]
async fn test_mark_workflow_is_idempotent() {
  let store = memory_store().await;
  let wf = workflow(&store).await;

  assert!(
    store
      .mark_workflow(&wf, WorkflowStatus::Completed)
      .await
      .unwrap()
  );
  assert!(
    !store
      .mark_workflow(&wf, WorkflowStatus::Completed)
      .await
      .unwrap()
  );

  let err = store
    .mark_workflow(&wf, WorkflowStatus::Failed)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    StoreError::ConflictingStatus {
      current: WorkflowStatus::Completed,
      requested: WorkflowStatus::Failed,
      ..
    }
  ));

  let err = store
    .mark_workflow(&wf, WorkflowStatus::InProgress)
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::NotTerminal(_)));
}

#[tokio::test]
async fn test_list_steps_in_creation_order() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let init = done_step(&store, &wf, "init", None, json!({})).await;
  done_step(&store, &wf, "a", Some(&init), json!({})).await;

  let kinds: Vec<String> = store
    .list_steps(&wf)
    .await
    .unwrap()
    .into_iter()
    .map(|step| step.kind)
    .collect();
  assert_eq!(kinds, vec!["init", "a"]);
}

#[tokio::test]
async fn test_find_ancestor_walks_parent_chain_only() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let init = done_step(&store, &wf, "init", None, json!({})).await;
  let a = done_step(&store, &wf, "a", Some(&init), json!({})).await;
  let sibling = done_step(&store, &wf, "sibling", Some(&init), json!({})).await;
  let b = store
    .insert_step(NewStep::new(&wf, "b", Some(a.clone()), json!({})))
    .await
    .unwrap();

  let found = store.find_ancestor(&b, "init").await.unwrap();
  assert_eq!(found.unwrap().id, init);
  assert!(store.find_ancestor(&b, "sibling").await.unwrap().is_none());
  assert!(store.find_ancestor(&b, "b").await.unwrap().is_none());
  assert!(store.find_ancestor(&sibling, "a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_idle_queued_steps() {
  let store = memory_store().await;
  let wf = workflow(&store).await;
  let queued = store
    .insert_step(NewStep::new(&wf, "init", None, json!({})))
    .await
    .unwrap();
  done_step(&store, &wf, "other", None, json!({})).await;

  assert!(
    store
      .claim_idle_queued_steps(Utc::now() - Duration::hours(1))
      .await
      .unwrap()
      .is_empty()
  );

  let idle = store
    .claim_idle_queued_steps(Utc::now() + Duration::seconds(1))
    .await
    .unwrap();
  assert_eq!(idle.len(), 1);
  assert_eq!(idle[0].id, queued);
  assert_eq!(idle[0].status, StepStatus::Queued);

  let cutoff = idle[0].updated_at;
  assert!(store.claim_idle_queued_steps(cutoff).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_claim_is_exclusive() {
  let store = memory_store().await;
  let registration = store
    .register(42, "workflow", &json!({ "prefetchCount": 5 }))
    .await
    .unwrap();
  assert_eq!(registration.status, WorkerStatus::Stopped);

  let claimed = store.claim(42).await.unwrap();
  assert_eq!(claimed.status, WorkerStatus::Running);
  assert!(claimed.last_started_at.is_some());

  let err = store.claim(42).await.unwrap_err();
  assert!(matches!(err, StoreError::AlreadyRunning { worker_id: 42 }));

  store.release(42).await.unwrap();
  let released = store.get_worker(42).await.unwrap();
  assert_eq!(released.status, WorkerStatus::Stopped);
  assert!(released.last_ended_at.is_some());

  let err = store.release(42).await.unwrap_err();
  assert!(matches!(err, StoreError::NotRunning { worker_id: 42 }));
}

#[tokio::test]
async fn test_register_refreshes_params_but_keeps_status() {
  let store = memory_store().await;
  store.register(1, "workflow", &json!({})).await.unwrap();
  store.claim(1).await.unwrap();

  let refreshed = store
    .register(1, "workflow", &json!({ "prefetchCount": 3 }))
    .await
    .unwrap();
  assert_eq!(refreshed.status, WorkerStatus::Running);
  assert_eq!(refreshed.params_json.0, json!({ "prefetchCount": 3 }));
}

#[tokio::test]
async fn test_claim_unknown_worker_is_not_found() {
  let store = memory_store().await;
  let err = store.claim(99).await.unwrap_err();
  assert!(matches!(err, StoreError::NotFound { entity: "worker", .. }));
}

#[tokio::test]
async fn test_pending_operations_roundtrip() {
  let store = memory_store().await;
  let older = PendingOperation {
    transaction_uuid: "tx-1".to_string(),
    chain_id: 1,
    tx_hash: Some("0x01".to_string()),
    raw_transaction: Json(json!({ "nonce": 1 })),
    after_completion: Json(json!({ "topic": "workflow.mint" })),
    created_at: Utc::now() - Duration::seconds(5),
  };
  let newer = PendingOperation {
    transaction_uuid: "tx-2".to_string(),
    created_at: Utc::now(),
    ..older.clone()
  };
  let other_chain = PendingOperation {
    transaction_uuid: "tx-3".to_string(),
    chain_id: 2,
    ..older.clone()
  };

  store.record(&newer).await.unwrap();
  store.record(&older).await.unwrap();
  store.record(&other_chain).await.unwrap();

  let listed = store.list_operations(1, 10).await.unwrap();
  let ids: Vec<&str> = listed.iter().map(|op| op.transaction_uuid.as_str()).collect();
  assert_eq!(ids, vec!["tx-1", "tx-2"]);
  assert_eq!(store.list_operations(1, 1).await.unwrap().len(), 1);

  assert!(store.remove("tx-1").await.unwrap());
  assert!(!store.remove("tx-1").await.unwrap());
  assert!(matches!(
    store.get_operation("tx-1").await.unwrap_err(),
    StoreError::NotFound { .. }
  ));
}
