mod admin;
mod assembly;
mod audit;
mod backoff;
mod blobstore;
mod command_poller;
mod config;
mod error;
mod finalizer;
mod handshake;
mod persistence;
#[cfg(test)]
mod pipeline_tests;
mod ratelimit;
mod reaper;
mod router;
mod transport;
mod types;

use std::sync::Arc;

use tracing::info;

use assembly::AssemblyManager;
use audit::AuditLogger;
use blobstore::HttpBlobStore;
use command_poller::CommandPoller;
use config::AppConfig;
use handshake::Handshake;
use persistence::{PersistenceFacade, PgPersistence};
use router::Router;
use transport::RumqttcTransport;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_backend=info".into()),
        )
        .init();

    admin::record_startup();

    let config = Arc::new(AppConfig::from_env());
    info!(
        "ingest-backend v{} starting — broker {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.mqtt_host,
        config.mqtt_port
    );

    let pg = PgPersistence::connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");
    pg.run_migrations().await.expect("failed to run migrations");
    let facade: Arc<dyn PersistenceFacade> = Arc::new(pg);

    let blob_store = Arc::new(HttpBlobStore::new(
        config.storage_endpoint.clone(),
        config.storage_bucket.clone(),
    ));

    let (transport_impl, inbound_rx) = RumqttcTransport::start(&config);
    let transport: Arc<dyn transport::Transport> = Arc::new(transport_impl);

    let audit = AuditLogger::new(facade.clone());

    let assembly_manager = AssemblyManager::new(
        config.clone(),
        facade.clone(),
        blob_store,
        transport.clone(),
        audit.clone(),
    );
    let handshake = Handshake::new(config.clone(), facade.clone(), transport.clone(), audit.clone());
    let poller = CommandPoller::new(config.clone(), facade.clone(), transport.clone(), audit.clone());

    let cancel = tokio_util::sync::CancellationToken::new();

    let router = Arc::new(Router::new(
        facade.clone(),
        audit.clone(),
        assembly_manager.clone(),
        handshake.clone(),
        poller.clone(),
    ));
    tokio::spawn(router.run(inbound_rx));

    tokio::spawn(reaper::run(
        assembly_manager.clone(),
        config.reaper_interval,
        cancel.clone(),
    ));

    tokio::spawn(poller.clone().run(cancel.clone()));

    let app = admin::router(facade.clone());
    let addr = format!("0.0.0.0:{}", config.admin_http_port);
    info!("admin http surface listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind admin http listener");

    let shutdown_grace = config.shutdown_grace;
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("admin http server exited: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining in-flight work (grace: {shutdown_grace:?})");
            cancel.cancel();
            tokio::time::sleep(shutdown_grace).await;
        }
    }
}
