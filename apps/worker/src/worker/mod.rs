//! Worker lifecycle: `Running -> Draining -> Stopped`.

pub mod shutdown;

pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::messaging::ConsumerLoop;
use crate::metrics::Metrics;

pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Running => 0.0,
            Self::Draining => 1.0,
            Self::Stopped => 2.0,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    /// Time allowed after the loop exits for buffered output to flush.
    pub drain_delay: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_delay: DEFAULT_DRAIN_DELAY,
        }
    }
}

/// Runs the consumer loop and walks the worker through its states.
pub struct ShutdownCoordinator {
    state: watch::Sender<WorkerState>,
    drain_delay: Duration,
    metrics: Arc<Metrics>,
}

impl ShutdownCoordinator {
    pub fn new(
        settings: ShutdownSettings,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<WorkerState>) {
        let (state, receiver) = watch::channel(WorkerState::Running);
        metrics.worker_state.set(WorkerState::Running.gauge_value());
        (
            Self {
                state,
                drain_delay: settings.drain_delay,
                metrics,
            },
            receiver,
        )
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub async fn run(&self, consumer: &ConsumerLoop, signal: ShutdownSignal) {
        let mut watcher = signal.clone();
        let consuming = consumer.run(signal);
        tokio::pin!(consuming);

        // The loop only returns once shutdown is observed, but either side
        // finishing first moves the worker to Draining.
        let loop_finished = tokio::select! {
            _ = &mut consuming => true,
            _ = watcher.triggered() => false,
        };

        self.transition(WorkerState::Draining);
        if !loop_finished {
            consuming.await;
        }

        info!(
            event = "drain_started",
            drain_delay_ms = self.drain_delay.as_millis() as u64,
            "Consumer loop exited, draining"
        );
        tokio::time::sleep(self.drain_delay).await;

        self.transition(WorkerState::Stopped);
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        self.metrics.worker_state.set(next.gauge_value());
        info!(
            event = "state_transition",
            from = %previous,
            to = %next,
            "Worker state changed"
        );
    }
}

pub struct Worker {
    consumer: Arc<ConsumerLoop>,
    settings: ShutdownSettings,
}

impl Worker {
    pub fn new(consumer: ConsumerLoop, settings: ShutdownSettings) -> Self {
        Self {
            consumer: Arc::new(consumer),
            settings,
        }
    }

    /// Spawns the worker onto the runtime.
    pub fn start(self) -> WorkerHandle {
        let (trigger, signal) = shutdown_channel();
        let (coordinator, state) =
            ShutdownCoordinator::new(self.settings, self.consumer.metrics().clone());
        let consumer = self.consumer;

        info!(event = "worker_started", "Worker started");
        let task = tokio::spawn(async move {
            coordinator.run(&consumer, signal).await;
        });

        WorkerHandle {
            trigger,
            state,
            task,
        }
    }
}

pub struct WorkerHandle {
    trigger: ShutdownTrigger,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Requests shutdown without waiting for it.
    pub fn signal_shutdown(&self) {
        self.trigger.trigger();
    }

    /// Signals shutdown and waits up to `grace` for the worker to stop.
    /// Returns the state observed when the wait ended; anything other than
    /// `Stopped` means the worker was aborted mid-flight.
    pub async fn stop(self, grace: Duration) -> WorkerState {
        info!(
            event = "stop_requested",
            grace_ms = grace.as_millis() as u64,
            "Stopping worker"
        );
        self.trigger.trigger();

        let mut state = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(grace, state.wait_for(|s| *s == WorkerState::Stopped)).await,
            Ok(Ok(_))
        );

        if reached {
            let _ = self.task.await;
            return WorkerState::Stopped;
        }

        let observed = *self.state.borrow();
        warn!(
            event = "stop_timed_out",
            state = %observed,
            "Grace period elapsed before the worker stopped, aborting"
        );
        self.task.abort();
        observed
    }

    /// Waits for the worker to finish after shutdown has been signalled.
    pub async fn wait(self) -> WorkerState {
        let _ = self.task.await;
        *self.state.borrow()
    }
}
