//! Scheduled relay: the publish and reap triggers wired to the engine.
//!
//! Both loops use fixed-delay scheduling. A cycle always runs to completion,
//! including every send it dispatched, before the delay starts, so cycles of
//! one relay never overlap. Shutdown is observed between cycles only.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::error::{ConfigError, OutflowResult};
use crate::publisher::{CycleReport, Publisher};
use crate::reaper::Reaper;
use crate::status::StatusTracker;
use crate::store::EventStore;

/// Publisher and reaper sharing one store, broker and configuration.
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn EventStore>,
    publisher: Publisher,
    reaper: Reaper,
    instance_id: Uuid,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tracker = StatusTracker::new(Arc::clone(&store)).with_mode(config.write_mode);
        let publisher =
            Publisher::new(Arc::clone(&store), broker, config.topic.clone()).with_tracker(tracker);
        let reaper = Reaper::new(Arc::clone(&store));

        Ok(Self {
            config,
            store,
            publisher,
            reaper,
            instance_id: Uuid::new_v4(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Identifies this relay in logs.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Publish entry point.
    pub async fn run_cycle(&self, limit: usize, now: DateTime<Utc>) -> CycleReport {
        self.publisher.run_cycle(limit, now).await
    }

    /// Reap entry point.
    pub async fn sweep(&self, lease_timeout: Duration) -> OutflowResult<u64> {
        self.reaper.sweep(lease_timeout).await
    }

    /// One publish cycle with the configured batch limit at the current time.
    pub async fn publish_once(&self) -> CycleReport {
        self.run_cycle(self.config.batch_limit, Utc::now()).await
    }

    /// One sweep with the configured lease timeout, followed by a queue
    /// snapshot in the logs. Errors are logged, never returned.
    pub async fn reap_once(&self) -> u64 {
        let released = match self.sweep(self.config.lease_timeout()).await {
            Ok(released) => released,
            Err(err) => {
                error!(error = %err, "Outbox reaper sweep failed");
                0
            }
        };

        match self.store.stats().await {
            Ok(stats) => debug!(
                started = stats.started,
                processing = stats.processing,
                failed = stats.failed,
                completed = stats.completed,
                "Outbox queue stats"
            ),
            Err(err) => debug!(error = %err, "Could not read outbox stats"),
        }
        released
    }

    /// Spawn the publish and reap loops on the current runtime.
    pub fn start(self) -> RelayHandle {
        let relay = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("relay", instance = %relay.instance_id);

        info!(
            parent: &span,
            topic = %relay.config.topic,
            batch_limit = relay.config.batch_limit,
            lease_timeout_secs = relay.config.lease_timeout_secs,
            "Starting outbox relay"
        );

        let publish = tokio::spawn(
            publish_loop(Arc::clone(&relay), shutdown_rx.clone()).instrument(span.clone()),
        );
        let reap = tokio::spawn(reap_loop(relay, shutdown_rx).instrument(span));

        RelayHandle {
            shutdown: shutdown_tx,
            tasks: vec![publish, reap],
        }
    }
}

async fn publish_loop(relay: Arc<Relay>, mut shutdown: watch::Receiver<bool>) {
    let interval = relay.config.publish_interval();
    info!(interval_ms = interval.as_millis() as u64, "Starting outbox polling worker");

    loop {
        if *shutdown.borrow() {
            break;
        }
        relay.publish_once().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Outbox polling worker stopped");
}

async fn reap_loop(relay: Arc<Relay>, mut shutdown: watch::Receiver<bool>) {
    let interval = relay.config.reap_interval();
    info!(interval_secs = interval.as_secs(), "Starting outbox reaper worker");

    loop {
        if *shutdown.borrow() {
            break;
        }
        relay.reap_once().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Outbox reaper worker stopped");
}

/// Running relay loops.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Ask both loops to stop after their current cycle and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Relay task ended abnormally");
            }
        }
    }
}
