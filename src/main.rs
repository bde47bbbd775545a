use clap::Parser;
use query_storage::config::NodeConfig;
use query_storage::executor::executor::TaskExecutor;
use query_storage::executor::registry::{QueryLogicRegistry, TaskOutcome};
use query_storage::expiration::reaper::ExpirationReaper;
use query_storage::lock::local::LocalLockProvider;
use query_storage::lock::remote::RemoteLockProvider;
use query_storage::lock::service::{self, LockTable};
use query_storage::lock::types::LockProvider;
use query_storage::query::types::{Query, QueryAction, QueryResult, QueryTask};
use query_storage::queue::local::LocalQueueManager;
use query_storage::storage::cache::QueryStorageCache;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const ECHO_PAGES: u64 = 3;

#[derive(Debug, Parser)]
#[clap(author, name = "query-storage-node", version, about)]
#[clap(rename_all = "kebab-case")]
struct Args {
    /// Serve the lock service on this address.
    #[clap(long)]
    bind: Option<SocketAddr>,
    /// JSON config file. Flags override its values.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Use the lock service at this URL instead of in-process locks.
    #[clap(long, env = "QUERY_STORAGE_LOCK_SERVICE")]
    lock_service: Option<String>,
    /// Number of task workers.
    #[clap(long)]
    workers: Option<usize>,
    /// Submit one EchoQuery with this text at startup and log its pages.
    #[clap(long)]
    demo_query: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.executor.worker_count = workers;
    }

    // 1. Locks:
    let locks: Arc<dyn LockProvider> = match &args.lock_service {
        Some(url) => {
            tracing::info!("Using lock service at {}", url);
            RemoteLockProvider::new(url.clone(), config.lock.clone())
        }
        None => {
            tracing::info!("Using in-process locks");
            LocalLockProvider::new(config.lock.lock_timeout)
        }
    };

    // 2. Storage and result queues:
    let queue = LocalQueueManager::new(&config.queue);
    let storage = QueryStorageCache::new(locks, queue, &config.storage);

    // 3. Query logic:
    let registry = QueryLogicRegistry::new();
    registry.register("EchoQuery", echo_query);

    let shutdown = CancellationToken::new();

    // 4. Workers and reaper:
    let executor = TaskExecutor::new(storage.clone(), registry, &config.executor);
    let mut workers = executor.start(shutdown.clone());

    let reaper = ExpirationReaper::new(storage.clone(), config.expiration.clone());
    workers.push(tokio::spawn(reaper.run(shutdown.clone())));

    // 5. Lock service:
    if let Some(bind_addr) = args.bind {
        let table = LockTable::new();
        let app = service::router(table.clone());

        let purge_shutdown = shutdown.clone();
        let lease_ttl = config.lock.lease_ttl;
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease_ttl);
            loop {
                tokio::select! {
                    _ = purge_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = table.purge_expired();
                        if purged > 0 {
                            tracing::debug!("Purged {} expired leases", purged);
                        }
                    }
                }
            }
        }));

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("Lock service listening on {}", bind_addr);

        let serve_shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("Lock service failed: {}", e);
            }
        }));
    }

    // 6. Demo query:
    if let Some(text) = args.demo_query {
        submit_demo_query(storage.clone(), text, shutdown.clone()).await?;
    }

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Worker ended abnormally: {}", e);
        }
    }
    storage.shutdown().await;

    Ok(())
}

/// Plans the query, echoes it back over a few pages, then closes.
async fn echo_query(task: QueryTask) -> anyhow::Result<TaskOutcome> {
    match task.action {
        QueryAction::Create => {
            let query: Query = serde_json::from_value(task.checkpoint.config.clone())?;
            Ok(TaskOutcome::done()
                .with_plan(format!("echo({})", query.query))
                .then(QueryAction::Next, json!({ "page": 0, "text": query.query })))
        }
        QueryAction::Next => {
            let config = &task.checkpoint.config;
            let page = config["page"]
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("checkpoint of {} has no page", task.task_key))?;
            let text = config["text"].as_str().unwrap_or_default().to_string();

            let result = QueryResult::new(
                format!("{}-{}", task.task_key.query_id(), page),
                json!({ "page": page, "text": text }),
            );
            let outcome = TaskOutcome::done().with_results(vec![result]);

            if page + 1 < ECHO_PAGES {
                Ok(outcome.then(QueryAction::Next, json!({ "page": page + 1, "text": text })))
            } else {
                Ok(outcome.then(QueryAction::Close, json!({})))
            }
        }
        _ => Ok(TaskOutcome::done()),
    }
}

async fn submit_demo_query(
    storage: Arc<QueryStorageCache>,
    text: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let task_key = storage
        .create_query(
            "default",
            Query::new(text, "EchoQuery"),
            "demo",
            BTreeSet::from(["PUBLIC".to_string()]),
            1,
        )
        .await?;
    let query_id = task_key.query_id().to_string();
    tracing::info!("Submitted demo query {}", query_id);

    let mut listener = storage
        .queue_manager()
        .create_listener("demo-listener", &query_id)
        .await?;

    tokio::spawn(async move {
        loop {
            match listener
                .receive_with_cancel(Duration::from_secs(5), &shutdown)
                .await
            {
                Ok(Some(result)) => {
                    tracing::info!("Demo result {}: {}", result.id, result.payload);
                    if let Err(e) = storage.record_results_returned(&query_id, 1).await {
                        tracing::warn!("Failed to record demo result: {}", e);
                    }
                }
                Ok(None) if shutdown.is_cancelled() => break,
                Ok(None) => {}
                Err(e) => {
                    tracing::info!("Demo listener finished: {}", e);
                    break;
                }
            }
        }
    });

    Ok(())
}
