//! Redis Streams broker for outflow.
//!
//! Every topic maps to one stream. Each record becomes one `XADD` entry with
//! `key` and `value` fields. A stream is totally ordered, so records for the
//! same key are read back in the order they were added.

use futures::FutureExt;
use outflow_core::{Broker, BrokerAck, BrokerError, BrokerRecord, Delivery};
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Prepended to the topic to form the stream key
    pub stream_prefix: String,

    /// How long to wait for `XADD` to be acknowledged
    pub send_timeout: Duration,

    /// Approximate `MAXLEN` trim applied on every add
    pub max_len: Option<usize>,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream_prefix: String::new(),
            send_timeout: Duration::from_secs(10),
            max_len: None,
        }
    }
}

impl RedisBrokerConfig {
    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.stream_prefix, topic)
    }
}

/// [`Broker`] backed by Redis Streams over one multiplexed connection.
pub struct RedisStreamBroker {
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
}

impl RedisStreamBroker {
    /// Connect to Redis.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url.as_str()).map_err(BrokerError::unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::unavailable)?;

        info!(
            prefix = %config.stream_prefix,
            send_timeout_ms = config.send_timeout.as_millis() as u64,
            "Connected to Redis broker"
        );
        Ok(Self { conn, config })
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }
}

impl Broker for RedisStreamBroker {
    /// The command is written to the connection when the delivery is first
    /// polled, so deliveries polled in send order keep per-key order.
    fn send(&self, record: BrokerRecord) -> Result<Delivery, BrokerError> {
        if record.topic.trim().is_empty() {
            return Err(BrokerError::Rejected("record has no topic".to_string()));
        }

        let cmd = xadd_command(
            &self.config.stream_key(&record.topic),
            &record,
            self.config.max_len,
        );
        let mut conn = self.conn.clone();
        let timeout = self.config.send_timeout;

        Ok(async move {
            let reply = cmd.query_async::<String>(&mut conn);
            await_entry_id(reply, timeout).await
        }
        .boxed())
    }
}

/// `XADD <stream> [MAXLEN ~ n] * key <key> value <value>`
pub fn xadd_command(stream_key: &str, record: &BrokerRecord, max_len: Option<usize>) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream_key);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*")
        .arg("key")
        .arg(&record.key)
        .arg("value")
        .arg(&record.value);
    cmd
}

/// Wait for an `XADD` reply and turn it into an acknowledgment.
async fn await_entry_id<F>(reply: F, timeout: Duration) -> Result<BrokerAck, BrokerError>
where
    F: Future<Output = RedisResult<String>>,
{
    match tokio::time::timeout(timeout, reply).await {
        Err(_) => Err(BrokerError::Timeout(timeout)),
        Ok(Err(err)) => Err(classify(err)),
        Ok(Ok(entry_id)) => Ok(BrokerAck {
            position: Some(entry_id),
        }),
    }
}

fn classify(err: RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BrokerError::unavailable(err)
    } else {
        BrokerError::Rejected(err.to_string())
    }
}
