use std::sync::Arc;

use anyhow::{Context, Result};
use portal_process_worker::clients::{
    build_http_client, HttpDidValidationService, HttpMailDispatcher, HttpWalletService,
};
use portal_process_worker::repositories::{self, PgChecklistRepository, PgMailingRepository};
use portal_process_worker::{
    build_registry, init_tracing, ChecklistExecutor, MailingExecutor, WorkerConfig,
    DEFAULT_LOG_FILTER,
};
use portal_processes::{PostgresProcessStore, ProcessExecutionService, ProcessWorker};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    init_tracing(DEFAULT_LOG_FILTER);

    tracing::info!("portal-process-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresProcessStore::new(pool.clone()));
    store
        .migrate()
        .await
        .context("Failed to apply process schema")?;
    repositories::migrate(&pool)
        .await
        .context("Failed to apply portal schema")?;

    let http = build_http_client(config.http_timeout).context("Failed to build HTTP client")?;
    let checklist = ChecklistExecutor::new(
        Arc::new(PgChecklistRepository::new(pool.clone())),
        Arc::new(HttpWalletService::new(&config.wallet_service_url, http.clone())),
        Arc::new(HttpDidValidationService::new(&config.did_validation_url, http.clone())),
    );
    let mailing = MailingExecutor::new(
        Arc::new(PgMailingRepository::new(pool.clone())),
        Arc::new(HttpMailDispatcher::new(&config.mail_service_url, http)),
    );
    let registry = build_registry(checklist, mailing).context("Invalid executor registry")?;

    tracing::info!(
        worker_id = %config.worker_id,
        process_types = ?registry.process_type_ids(),
        batch_size = config.batch_size,
        max_concurrent = config.max_concurrent_processes,
        "Starting process worker"
    );

    let service = Arc::new(ProcessExecutionService::new(
        store,
        registry,
        config.engine_config(),
    ));
    let worker = ProcessWorker::new(config.worker_id.clone(), service, config.poller_config());
    let cancel = CancellationToken::new();

    if config.run_once {
        let summary = worker.run_once(&cancel).await?;
        tracing::info!(
            processes = summary.processes_executed,
            steps = summary.steps_executed,
            errors = summary.errors,
            "Single pass complete"
        );
        return Ok(());
    }

    let run = worker.run(cancel.clone());
    tokio::pin!(run);

    // Run the worker (blocks until shutdown)
    let stats = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            cancel.cancel();
            run.await
        }
    };

    match stats {
        Ok(stats) => {
            tracing::info!(
                passes = stats.passes,
                steps = stats.steps_executed,
                conflicts = stats.conflicts,
                errors = stats.errors,
                "Worker shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker error");
            Err(e.into())
        }
    }
}
