mod chains;
mod handlers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chainsaga_broker::{Broker, SqliteBroker};
use chainsaga_executor::{ChainRegistry, Dispatcher, ExecutorDeps, StepExecutor};
use chainsaga_graph::StepGraph;
use chainsaga_store::{SqliteStore, WorkerRegistry};
use chainsaga_worker::{Finalizer, RuntimeParams, Sweeper, WorkerRuntime};

use crate::chains::{JsonRpcChain, RpcClient};

/// Chainsaga - a durable workflow worker for multi-step chain operations
#[derive(Debug, Parser)]
#[command(name = "chainsaga")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Id of the cron_processes row this worker owns
  #[arg(long = "cronProcessId")]
  cron_process_id: i64,

  /// SQLite database holding workflows, steps and broker messages
  #[arg(long, env = "CHAINSAGA_DATABASE_URL", default_value = "sqlite://chainsaga.db")]
  database_url: String,

  /// Directory of workflow graph definitions (*.json)
  #[arg(long, env = "CHAINSAGA_WORKFLOWS_DIR", default_value = "workflows")]
  workflows_dir: PathBuf,
}

fn main() -> ExitCode {
  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(e) => {
      let _ = e.print();
      return if e.use_stderr() {
        ExitCode::FAILURE
      } else {
        ExitCode::SUCCESS
      };
    }
  };

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let rt = match tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(e) => {
      error!(error = %e, "runtime_build_failed");
      return ExitCode::FAILURE;
    }
  };

  match rt.block_on(run(cli)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %format!("{e:#}"), "worker_exited");
      ExitCode::FAILURE
    }
  }
}

async fn run(cli: Cli) -> Result<()> {
  let store = Arc::new(
    SqliteStore::connect(&cli.database_url)
      .await
      .with_context(|| format!("failed to open database: {}", cli.database_url))?,
  );
  store
    .migrate()
    .await
    .context("failed to run database migrations")?;

  let graphs = load_graphs(&cli.workflows_dir).await?;

  let worker_id = cli.cron_process_id;
  let params = chainsaga_worker::claim(store.as_ref(), worker_id)
    .await
    .with_context(|| format!("failed to claim worker {worker_id}"))?;

  // The row is ours from here on and must be released on every exit path.
  let runtime = match build_runtime(worker_id, params, store.clone(), graphs) {
    Ok(runtime) => runtime,
    Err(e) => {
      if let Err(release) = store.release(worker_id).await {
        error!(worker_id, error = %release, "worker_release_failed");
      }
      return Err(e);
    }
  };

  let shutdown = CancellationToken::new();
  tokio::spawn(wait_for_signal(shutdown.clone()));

  runtime
    .run(shutdown)
    .await
    .with_context(|| format!("worker {worker_id} stopped with an error"))
}

fn build_runtime(
  worker_id: i64,
  params: RuntimeParams,
  store: Arc<SqliteStore>,
  graphs: Vec<StepGraph>,
) -> Result<WorkerRuntime> {
  let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(store.pool().clone()));

  let mut chains = ChainRegistry::new();
  let mut clients = HashMap::new();
  for (chain_id, url) in &params.rpc_urls {
    let rpc = Arc::new(RpcClient::new(*chain_id, url.as_str()));
    chains.register(Arc::new(JsonRpcChain::new(rpc.clone())));
    clients.insert(*chain_id, rpc);
  }
  let chains = Arc::new(chains);
  let handlers = handlers::builtin(clients);

  let deps = ExecutorDeps::new(store.clone(), store.clone(), broker.clone(), chains.clone())
    .with_max_step_retries(params.max_step_retries);

  let mut dispatcher = Dispatcher::new();
  for graph in graphs {
    let kind = graph.kind().clone();
    let deps = deps.clone();
    dispatcher
      .register(kind.clone(), || StepExecutor::new(graph, &handlers, deps))
      .with_context(|| format!("failed to build workflow {kind}"))?;
  }

  let sweeper = Sweeper::new(store.clone(), broker.clone(), params.stale_step_timeout())
    .with_interval(params.sweeper_interval());
  let finalizer = match chains.resolve(params.chain_id) {
    Ok(chain) => Some(
      Finalizer::new(chain, store.clone(), broker.clone())
        .with_batch_size(params.finalizer_batch_size)
        .with_interval(params.finalizer_interval()),
    ),
    Err(_) => {
      warn!(chain_id = params.chain_id, "finalizer_disabled");
      None
    }
  };

  let mut runtime = WorkerRuntime::new(worker_id, params, Arc::new(dispatcher), broker, store)
    .with_sweeper(sweeper);
  if let Some(finalizer) = finalizer {
    runtime = runtime.with_finalizer(finalizer);
  }
  Ok(runtime)
}

/// Load every `*.json` graph in `dir`, in file name order.
async fn load_graphs(dir: &Path) -> Result<Vec<StepGraph>> {
  let mut entries = tokio::fs::read_dir(dir)
    .await
    .with_context(|| format!("failed to read workflows directory: {}", dir.display()))?;

  let mut paths = Vec::new();
  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    if path.extension().is_some_and(|ext| ext == "json") {
      paths.push(path);
    }
  }
  paths.sort();

  let mut graphs = Vec::new();
  for path in paths {
    let content = tokio::fs::read_to_string(&path)
      .await
      .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
    let graph = StepGraph::from_json(&content)
      .with_context(|| format!("invalid workflow file: {}", path.display()))?;
    info!(kind = %graph.kind(), path = %path.display(), "workflow_loaded");
    graphs.push(graph);
  }

  if graphs.is_empty() {
    bail!("no workflow definitions found in {}", dir.display());
  }
  Ok(graphs)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
  let interrupt = async {
    if let Err(e) = signal::ctrl_c().await {
      warn!(error = %e, "interrupt_handler_failed");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut terminate) => {
        terminate.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "terminate_handler_failed");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = interrupt => info!(signal = "SIGINT", "shutdown_signal"),
    _ = terminate => info!(signal = "SIGTERM", "shutdown_signal"),
  }
  shutdown.cancel();
}
