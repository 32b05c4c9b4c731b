use anyhow::Result;
use cloud_migrator::{
    adapters::AdapterRegistry,
    config::AppConfig,
    routes::routes::{AppState, routes},
    services::{
        broker::SqliteBroker,
        dispatcher::Dispatcher,
        lock::LeaseLock,
        metadata_store::{MetadataStore, SqliteStore},
        mover::Mover,
        plan_service::PlanService,
        trigger::TriggerManager,
        worker::{JobRunner, Worker},
    },
};
use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting cloud-migrator with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Create the database directory if needed ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Open the store; the schema is applied on connect ---
    let store = SqliteStore::connect(&cfg.database_url).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    let shared: Arc<dyn MetadataStore> = Arc::new(store.clone());
    let broker = SqliteBroker::new(store.clone());

    // --- Worker half ---
    let worker = if cfg.mode.runs_worker() {
        let mover = Mover::new(
            AdapterRegistry::with_defaults(&cfg.storage_dir),
            shared.clone(),
            cfg.transfer_settings(),
        );
        let worker = Worker::new(JobRunner::new(shared.clone(), mover), cfg.worker_settings());
        let consumer = broker.subscribe(cfg.consumer_config()).await?;
        let cancel = cancel.clone();
        Some(tokio::spawn(async move { worker.run(consumer, cancel).await }))
    } else {
        None
    };

    // --- Scheduler half ---
    if cfg.mode.runs_scheduler() {
        serve(&cfg, store, shared, broker, cancel.clone()).await?;
    }

    if let Some(worker) = worker {
        worker.await?;
    }
    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn serve(
    cfg: &AppConfig,
    store: SqliteStore,
    shared: Arc<dyn MetadataStore>,
    broker: SqliteBroker,
    cancel: CancellationToken,
) -> Result<()> {
    let holder = format!(
        "{}-{}",
        env::var("HOSTNAME").unwrap_or_else(|_| "scheduler".into()),
        Uuid::new_v4()
    );
    let lock = Arc::new(LeaseLock::new(store, holder, cfg.lock_lease()));
    let triggers = Arc::new(TriggerManager::new());
    let dispatcher = Dispatcher::new(Arc::new(broker), cfg.topic.clone());
    let plans = Arc::new(PlanService::new(shared.clone(), lock, triggers.clone(), dispatcher));
    plans.restore_triggers().await?;

    // --- Build router ---
    let app = routes().with_state(AppState {
        plans,
        store: shared,
        storage_dir: PathBuf::from(&cfg.storage_dir),
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    triggers.shutdown().await;
    Ok(())
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for interrupt: {}", err);
        return;
    }
    tracing::info!("Interrupt received, shutting down");
    cancel.cancel();
}
