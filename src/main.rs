//! WMS Transfer - posting recovery service
//!
//! ```text
//! ┌──────────┐    ┌───────────────┐    ┌──────────────┐    ┌─────────┐
//! │  Config  │───▶│  Coordinator  │───▶│ Recovery     │───▶│   ERP   │
//! │  (YAML)  │    │ (store + ERP) │    │ Worker (loop)│    │ (B1 SL) │
//! └──────────┘    └───────────────┘    └──────────────┘    └─────────┘
//! ```
//!
//! The coordinator is embedded by the WMS front end; this binary keeps the
//! documents it left in `qc_approved` moving.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use wms_transfer::authority::ServiceLayerAuthority;
use wms_transfer::config::AppConfig;
use wms_transfer::erp::ServiceLayerClient;
use wms_transfer::posting::ServiceLayerPosting;
use wms_transfer::transfer::{
    MemoryTransferStore, PgTransferStore, PostingRecoveryWorker, TransferCoordinator,
    TransferStore,
};
use wms_transfer::validation::BatchValidator;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).with_context(|| format!("loading {} config", env))?;
    let _log_guard = wms_transfer::logging::init_logging(&app_config);

    tracing::info!("Starting WMS transfer service in {} mode", env);

    let store: Arc<dyn TransferStore> = match &app_config.postgres_url {
        Some(url) => {
            let store = PgTransferStore::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            store.init_schema().await.context("initializing schema")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("No postgres_url configured, documents are kept in memory");
            Arc::new(MemoryTransferStore::new())
        }
    };

    let validator_config = app_config
        .validation
        .to_validator_config()
        .context("validation config")?;
    let checkpoint_ttl = validator_config.checkpoint_ttl;

    let client = Arc::new(
        ServiceLayerClient::new(app_config.erp.clone()).context("building ERP client")?,
    );
    let authority = Arc::new(ServiceLayerAuthority::new(
        client.clone(),
        app_config.authority.clone(),
    ));
    let posting = Arc::new(ServiceLayerPosting::new(client));

    let coordinator = Arc::new(TransferCoordinator::new(
        store,
        BatchValidator::new(authority, validator_config),
        posting,
    ));

    let worker = PostingRecoveryWorker::new(
        coordinator,
        app_config.recovery.to_worker_config(),
        checkpoint_ttl,
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            trigger.cancel();
        }
    });

    worker.run(shutdown).await;
    Ok(())
}
