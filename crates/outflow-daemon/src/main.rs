//! Outflow relay binary.
//!
//! Usage: outflow --database-url <url> [--redis-url <url>] [--topic <topic>]
//!
//! Applies the outbox migration, then publishes rows from `outbox_event` to a
//! Redis stream until interrupted. Any number of copies may run against the
//! same database.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use outflow_core::{Relay, RelayConfig, WriteMode};
use outflow_postgres::PgEventStore;
use outflow_redis::{RedisBrokerConfig, RedisStreamBroker};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WriteModeArg {
    ById,
    Versioned,
}

impl From<WriteModeArg> for WriteMode {
    fn from(arg: WriteModeArg) -> Self {
        match arg {
            WriteModeArg::ById => WriteMode::ById,
            WriteModeArg::Versioned => WriteMode::Versioned,
        }
    }
}

/// Outflow: transactional outbox relay.
#[derive(Parser, Debug)]
#[command(name = "outflow")]
#[command(about = "Relays transactional outbox rows from PostgreSQL to Redis Streams")]
struct Args {
    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum pooled database connections.
    #[arg(long, env = "OUTFLOW_MAX_CONNECTIONS", default_value = "5")]
    max_connections: u32,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Prefix for the stream key.
    #[arg(long, env = "OUTFLOW_STREAM_PREFIX", default_value = "")]
    stream_prefix: String,

    /// Approximate stream length cap.
    #[arg(long, env = "OUTFLOW_STREAM_MAX_LEN")]
    max_len: Option<usize>,

    /// Broker topic every event is sent to.
    #[arg(long, env = "OUTFLOW_TOPIC", default_value = "outbox")]
    topic: String,

    /// Events claimed per publish cycle.
    #[arg(long, env = "OUTFLOW_BATCH_LIMIT", default_value = "10")]
    batch_limit: usize,

    /// Seconds a claim may stay PROCESSING before it is released.
    #[arg(long, env = "OUTFLOW_LEASE_TIMEOUT_SECS", default_value = "180")]
    lease_timeout_secs: u64,

    /// Delay between publish cycles in milliseconds.
    #[arg(long, env = "OUTFLOW_PUBLISH_INTERVAL_MS", default_value = "5000")]
    publish_interval_ms: u64,

    /// Delay between reaper sweeps in seconds.
    #[arg(long, env = "OUTFLOW_REAP_INTERVAL_SECS", default_value = "60")]
    reap_interval_secs: u64,

    /// Broker acknowledgment timeout in seconds.
    #[arg(long, env = "OUTFLOW_SEND_TIMEOUT_SECS", default_value = "10")]
    send_timeout_secs: u64,

    /// How status writes target the row.
    #[arg(long, env = "OUTFLOW_WRITE_MODE", value_enum, default_value = "by-id")]
    write_mode: WriteModeArg,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            topic: self.topic.clone(),
            batch_limit: self.batch_limit,
            lease_timeout_secs: self.lease_timeout_secs,
            publish_interval_ms: self.publish_interval_ms,
            reap_interval_secs: self.reap_interval_secs,
            write_mode: self.write_mode.into(),
        }
    }

    fn broker_config(&self) -> RedisBrokerConfig {
        RedisBrokerConfig {
            url: self.redis_url.clone(),
            stream_prefix: self.stream_prefix.clone(),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            max_len: self.max_len,
        }
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", args.log_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Outflow starting...");

    let config = args.relay_config();
    config.validate().context("invalid relay configuration")?;

    let store = PgEventStore::connect(&args.database_url, args.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store
        .migrate()
        .await
        .context("failed to apply outbox migrations")?;

    let broker_config = args.broker_config();
    let broker = RedisStreamBroker::connect(broker_config.clone())
        .await
        .context("failed to connect to Redis")?;

    let relay = Relay::new(config, Arc::new(store), Arc::new(broker))?;
    let config = relay.config();
    info!(
        topic = %config.topic,
        stream = %broker_config.stream_key(&config.topic),
        batch_limit = config.batch_limit,
        lease_timeout_secs = config.lease_timeout_secs,
        publish_interval_ms = config.publish_interval_ms,
        reap_interval_secs = config.reap_interval_secs,
        write_mode = ?config.write_mode,
        "Configuration loaded"
    );

    let instance = relay.instance_id();
    let handle = relay.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(%instance, "Received shutdown signal, draining current cycles...");

    handle.shutdown().await;
    info!("Outflow stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_defaults() {
        let args = Args::parse_from(["outflow", "--database-url", "postgres://localhost/app"]);

        assert_eq!(args.relay_config(), RelayConfig::default());
        assert_eq!(args.broker_config().send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "outflow",
            "--database-url",
            "postgres://localhost/app",
            "--topic",
            "orders",
            "--batch-limit",
            "50",
            "--write-mode",
            "versioned",
            "--stream-prefix",
            "outbox:",
        ]);

        let config = args.relay_config();
        assert_eq!(config.topic, "orders");
        assert_eq!(config.batch_limit, 50);
        assert_eq!(config.write_mode, WriteMode::Versioned);
        assert_eq!(args.broker_config().stream_key("orders"), "outbox:orders");
    }
}
