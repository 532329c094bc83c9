use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nl2sql_backend::api::handlers::AppState;
use nl2sql_backend::api::routes::create_router;
use nl2sql_backend::config::Config;
use nl2sql_backend::services::database::{DatabaseAdapter, PostgreSQLAdapter};
use nl2sql_backend::services::{
    ConnectionPool, HttpLlmClient, IntentRouter, LlmChatResponder, LlmService, Orchestrator, QueryService,
    QuerySynthesizer, SchemaCatalogService, SessionManager,
};
use nl2sql_backend::storage::SqliteStorage;
use nl2sql_backend::validation::{SafetyPolicy, SqlValidator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());

    // Target database
    let pool = ConnectionPool::from_config(&config.database).context("Failed to create connection pool")?;
    let adapter: Arc<dyn DatabaseAdapter> = Arc::new(
        PostgreSQLAdapter::new(pool.pool(), &config.database.url).context("Invalid database URL")?,
    );
    if let Err(e) = adapter.test_connection().await {
        warn!("Database is not reachable yet: {}", e);
    }

    // Last good schema snapshot
    let storage = match SqliteStorage::new(&config.storage.path).await {
        Ok(storage) => Some(Arc::new(storage)),
        Err(e) => {
            error!("Failed to open snapshot storage at {}: {}", config.storage.path, e);
            None
        }
    };

    let catalog = Arc::new(SchemaCatalogService::new(
        adapter.clone(),
        storage,
        config.database.schema.clone(),
        config.catalog.sample_rows,
    ));
    match catalog.warm_start().await {
        Ok(snapshot) => info!(
            "Schema catalog version {} ready ({} tables)",
            snapshot.version,
            snapshot.tables.len()
        ),
        Err(e) => warn!("Starting without a schema catalog: {}", e),
    }

    let shutdown = CancellationToken::new();
    let refresh_task = catalog.clone().spawn_refresh(
        Duration::from_secs(config.catalog.refresh_interval_secs.max(1)),
        shutdown.clone(),
    );

    // Language model
    let llm_client = HttpLlmClient::new(&config.llm, config.pipeline.turn_deadline())
        .context("Failed to create LLM client")?;
    let llm = LlmService::new(Arc::new(llm_client), &config.llm);
    info!("Using LLM provider: {}", llm.provider());

    let pipeline = &config.pipeline;
    let orchestrator = Orchestrator::new(
        catalog.clone(),
        IntentRouter::new(llm.clone(), pipeline.confidence_threshold, pipeline.history_window),
        QuerySynthesizer::new(llm.clone(), pipeline),
        SqlValidator::new(SafetyPolicy {
            wide_table_rows: pipeline.wide_table_rows,
            ..SafetyPolicy::default()
        }),
        QueryService::new(adapter, pipeline.row_cap),
        Arc::new(LlmChatResponder::new(llm, Some(catalog.clone()), pipeline.history_window)),
        pipeline.clone(),
    );

    let sessions = Arc::new(SessionManager::new(Arc::new(orchestrator), &config.session));
    let sweep_task = sessions
        .clone()
        .spawn_sweeper(config.session.sweep_interval(), shutdown.clone());

    let state = AppState { sessions, catalog };
    let app = create_router(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = refresh_task.await;
    let _ = sweep_task.await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    error!("Failed to listen for shutdown signal: {}", e);
                    shutdown.cancelled().await;
                }
            }
        }
    }
}
