use anyhow::Context;
use resume_intake::{
    api,
    config::{Config, TaskSettings},
    extraction::EngineSelector,
    logging,
    metrics::TaskMetrics,
    orchestrator::TaskOrchestrator,
    service::IntakeService,
    storage::{BinaryFetcher, SupabaseStorage},
    structuring::ChatCompletionClient,
    tasks,
    worker::Dispatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load().context("Failed to load configuration")?);
    logging::init_tracing();

    let store = tasks::open_store(&config.tasks)
        .await
        .context("Failed to open task store")?;
    let metrics = Arc::new(TaskMetrics::new());

    let storage = Arc::new(
        SupabaseStorage::new(&config.storage).context("Failed to build storage client")?,
    );
    let fetcher = BinaryFetcher::new(storage.clone(), config.storage.clone());
    let selector = EngineSelector::from_settings(&config.extraction);
    let structurer =
        ChatCompletionClient::new(&config.llm).context("Failed to build structuring client")?;
    let orchestrator = Arc::new(TaskOrchestrator::new(
        store.clone(),
        fetcher,
        selector,
        Arc::new(structurer),
        config.llm.timeout,
        metrics.clone(),
    ));

    let dispatcher = Arc::new(start_dispatcher(orchestrator, &config.tasks));
    dispatcher
        .recover(store.as_ref())
        .await
        .context("Failed to recover unfinished tasks")?;

    let service = IntakeService::new(
        store,
        dispatcher.clone(),
        metrics,
        storage,
        config.storage.clone(),
    );
    let app = api::create_router(Arc::new(service));

    let (listener, port) = bind_listener(config.server_port)
        .await
        .context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    dispatcher.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn start_dispatcher(orchestrator: Arc<TaskOrchestrator>, settings: &TaskSettings) -> Dispatcher {
    Dispatcher::start(orchestrator, settings.workers, settings.queue_capacity)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn bind_listener(server_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
