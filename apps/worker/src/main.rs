use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;

use config::{Config, LogFormat, SecretSource};
use queue_worker::handlers::BlobEventHandler;
use queue_worker::messaging::{
    ConnectionError, ConsumerLoop, QueueTransport, RabbitMqConnection, RabbitMqTransport,
    TransportError,
};
use queue_worker::metrics::{server::start_metrics_server, Metrics};
use queue_worker::secrets::{EnvSecretProvider, FileSecretProvider, SecretCache, SecretProvider};
use queue_worker::storage::{CredentialedResourceClient, FsConnector, ResourceError};
use queue_worker::worker::{Worker, WorkerState};

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("Failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Storage(#[from] ResourceError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(std::io::Error),
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log, config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = %config.queue_name,
        "Queue worker starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Queue worker failed");
        std::process::exit(1);
    }

    info!("Queue worker stopped");
}

async fn run(config: Config) -> Result<(), WorkerError> {
    let metrics = Metrics::new()?;

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, port = metrics_port, "Metrics server error");
        }
    });

    let provider: Arc<dyn SecretProvider> = match &config.secret_source {
        SecretSource::Env => Arc::new(EnvSecretProvider::new()),
        SecretSource::File { dir } => Arc::new(FileSecretProvider::new(dir.clone())),
    };
    let secrets = Arc::new(SecretCache::new(provider, config.secret_ttl));

    let storage = CredentialedResourceClient::connect(
        secrets,
        config.storage_secret_name.clone(),
        Arc::new(FsConnector),
        config.retry_policy(),
        metrics.clone(),
    )
    .await?;
    info!(secret = %config.storage_secret_name, "Storage client ready");

    let rabbitmq = RabbitMqConnection::connect(&config.rabbitmq_url).await?;
    let channel = rabbitmq.open_channel().await?;
    let transport = Arc::new(RabbitMqTransport::new(channel, config.queue_name.clone()));
    transport.ensure_exists().await?;

    let consumer = ConsumerLoop::new(
        transport,
        Arc::new(BlobEventHandler::new(Arc::new(storage))),
        config.consumer_settings(),
        metrics,
    );
    let handle = Worker::new(consumer, config.shutdown_settings()).start();

    info!(queue = %config.queue_name, "Ready to process queue messages");

    let signalled = wait_for_shutdown_signal().await;
    warn!("Shutdown signal received, cleaning up...");

    let final_state = handle.stop(config.shutdown_grace).await;
    if final_state != WorkerState::Stopped {
        warn!(
            state = %final_state,
            grace_secs = config.shutdown_grace.as_secs(),
            "Worker did not stop within the grace period"
        );
    }

    if rabbitmq.is_connected() {
        if let Err(e) = rabbitmq.shutdown().await {
            error!(error = %e, "Error during shutdown");
        }
    }

    signalled.map_err(WorkerError::Signal)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn setup_logging(rust_log: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
    };

    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
