use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_processed_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub messages_dead_lettered_total: Counter,
    pub lease_expired_total: Counter,
    pub poll_errors_total: Counter,
    pub message_processing_duration_seconds: HistogramVec,
    pub storage_attempts_total: CounterVec,
    pub secret_invalidations_total: CounterVec,
    pub client_rebuild_duration_seconds: Histogram,
    pub worker_state: Gauge,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_processed_total = CounterVec::new(
            Opts::new(
                "worker_messages_processed_total",
                "Total number of messages whose handler succeeded",
            ),
            &["queue"],
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "worker_messages_failed_total",
                "Total number of handler failures left on the queue for redelivery",
            ),
            &["queue", "error_type"],
        )?;

        let messages_dead_lettered_total = Counter::new(
            "worker_messages_dead_lettered_total",
            "Total number of messages moved to the dead letter destination",
        )?;

        let lease_expired_total = Counter::new(
            "worker_lease_expired_total",
            "Total number of deletes rejected because the lease had expired",
        )?;

        let poll_errors_total = Counter::new(
            "worker_poll_errors_total",
            "Total number of failed receive calls",
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "worker_message_processing_duration_seconds",
                "Time taken to run the handler for a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["queue", "status"],
        )?;

        let storage_attempts_total = CounterVec::new(
            Opts::new(
                "worker_storage_attempts_total",
                "Storage operation attempts by outcome",
            ),
            &["operation", "outcome"],
        )?;

        let secret_invalidations_total = CounterVec::new(
            Opts::new(
                "worker_secret_invalidations_total",
                "Cached secrets invalidated after an authentication failure",
            ),
            &["secret"],
        )?;

        let client_rebuild_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "worker_client_rebuild_duration_seconds",
                "Time taken to refetch credentials and rebuild the storage client",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let worker_state = Gauge::new(
            "worker_state",
            "Worker lifecycle state (0 = running, 1 = draining, 2 = stopped)",
        )?;

        let active_consumers = Gauge::new(
            "worker_active_consumers",
            "Number of active consumer loops",
        )?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(lease_expired_total.clone()))?;
        registry.register(Box::new(poll_errors_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(storage_attempts_total.clone()))?;
        registry.register(Box::new(secret_invalidations_total.clone()))?;
        registry.register(Box::new(client_rebuild_duration_seconds.clone()))?;
        registry.register(Box::new(worker_state.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            messages_processed_total,
            messages_failed_total,
            messages_dead_lettered_total,
            lease_expired_total,
            poll_errors_total,
            message_processing_duration_seconds,
            storage_attempts_total,
            secret_invalidations_total,
            client_rebuild_duration_seconds,
            worker_state,
            active_consumers,
            registry,
        }))
    }
}
