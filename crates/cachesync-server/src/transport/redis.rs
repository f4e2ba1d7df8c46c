//! Redis implementation of [`PubSubTransport`].
//!
//! Two connections, as Redis requires:
//!
//! - **Publisher**: a `deadpool-redis` pool used for `PUBLISH` and the
//!   `PUBSUB CHANNELS` / `PUBSUB NUMSUB` introspection commands
//! - **Subscriber**: one dedicated `redis::aio::PubSub` connection owned by a
//!   background task. Subscribe/unsubscribe requests reach it over an mpsc
//!   channel; inbound messages and status changes leave it through the
//!   [`StatusBoard`].
//!
//! ## Reconnection
//!
//! ```text
//! connecting ──► ready ──(stream ends)──► closed ──► reconnecting ──(delay)──► connecting
//! ```
//!
//! A fresh subscriber connection starts with no subscriptions. The task does
//! not replay them; the recovery controller restores them from the
//! subscription registry.

use std::time::Duration;

use async_trait::async_trait;
use cachesync_core::{
    ConnectionRole, ConnectionStatus, PubSubTransport, StatusBoard, TransportError, TransportEvent,
};
use deadpool_redis::{Pool, PoolConfig, Runtime, Timeouts};
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;

/// Capacity of the subscribe/unsubscribe command queue.
const COMMAND_BUFFER: usize = 64;

/// How long `close()` waits for the subscriber task to exit.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug)]
enum SubscriberCommand {
    Subscribe { channel: String, reply: Reply },
    Unsubscribe { channel: String, reply: Reply },
    PSubscribe { pattern: String, reply: Reply },
    PUnsubscribe { pattern: String, reply: Reply },
}

impl SubscriberCommand {
    fn reject(self, error: TransportError) {
        let reply = match self {
            SubscriberCommand::Subscribe { reply, .. }
            | SubscriberCommand::Unsubscribe { reply, .. }
            | SubscriberCommand::PSubscribe { reply, .. }
            | SubscriberCommand::PUnsubscribe { reply, .. } => reply,
        };
        let _ = reply.send(Err(error));
    }
}

/// Redis pub/sub transport.
pub struct RedisTransport {
    pool: Pool,
    board: StatusBoard,
    commands: mpsc::Sender<SubscriberCommand>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    /// Create the publisher pool and start the subscriber task.
    ///
    /// Fails only on invalid configuration. An unreachable server is not an
    /// error: the connections report `connecting`/`reconnecting` and keep
    /// retrying.
    pub async fn connect(config: &RedisConfig) -> Result<Self, TransportError> {
        let pool = build_pool(config)?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TransportError::connection(format!("failed to create Redis client: {e}")))?;

        let board = StatusBoard::new(ConnectionStatus::Connecting);

        match ping(&pool).await {
            Ok(()) => {
                board.set(ConnectionRole::Publisher, ConnectionStatus::Ready);
                info!(url = %config.url, "Redis publisher connected");
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "Redis publisher not reachable yet");
                board.error(ConnectionRole::Publisher, e);
            }
        }

        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();
        let task = SubscriberTask {
            client,
            commands: rx,
            board: board.clone(),
            connect_timeout: config.timeout(),
            reconnect_delay: config.reconnect_delay(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            pool,
            board,
            commands,
            shutdown,
            task: Mutex::new(Some(handle)),
        })
    }

    async fn send_command(
        &self,
        build: impl FnOnce(Reply) -> SubscriberCommand,
    ) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Track publisher health from command results.
    fn observe_publisher<T>(&self, result: &Result<T, String>) {
        match result {
            Ok(_) => {
                if !self.board.get(ConnectionRole::Publisher).is_ready() {
                    self.board
                        .set(ConnectionRole::Publisher, ConnectionStatus::Ready);
                }
            }
            Err(e) => self.board.error(ConnectionRole::Publisher, e.clone()),
        }
    }

    async fn publisher_conn(&self) -> Result<deadpool_redis::Connection, String> {
        self.pool
            .get()
            .await
            .map_err(|e| format!("failed to get Redis connection: {e}"))
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, TransportError> {
        let result = async {
            let mut conn = self.publisher_conn().await?;
            conn.publish::<_, _, u64>(channel, payload)
                .await
                .map_err(|e| e.to_string())
        }
        .await;
        self.observe_publisher(&result);
        result.map_err(|reason| TransportError::publish(channel, reason))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.send_command(|reply| SubscriberCommand::Subscribe { channel, reply })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.send_command(|reply| SubscriberCommand::Unsubscribe { channel, reply })
            .await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let pattern = pattern.to_string();
        self.send_command(|reply| SubscriberCommand::PSubscribe { pattern, reply })
            .await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let pattern = pattern.to_string();
        self.send_command(|reply| SubscriberCommand::PUnsubscribe { pattern, reply })
            .await
    }

    async fn query_channels(&self, pattern: Option<&str>) -> Result<Vec<String>, TransportError> {
        let result = async {
            let mut conn = self.publisher_conn().await?;
            let channels: Vec<String> = redis::cmd("PUBSUB")
                .arg("CHANNELS")
                .arg(pattern.unwrap_or("*"))
                .query_async(&mut conn)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(channels)
        }
        .await;
        self.observe_publisher(&result);
        result.map_err(TransportError::query)
    }

    async fn subscriber_count(&self, channel: &str) -> Result<u64, TransportError> {
        let result = async {
            let mut conn = self.publisher_conn().await?;
            let (_, count): (String, u64) = redis::cmd("PUBSUB")
                .arg("NUMSUB")
                .arg(channel)
                .query_async(&mut conn)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>(count)
        }
        .await;
        self.observe_publisher(&result);
        result.map_err(TransportError::query)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.board.subscribe()
    }

    fn status(&self, role: ConnectionRole) -> ConnectionStatus {
        self.board.get(role)
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("Redis subscriber task did not stop in time");
            }
        }
        self.board
            .set(ConnectionRole::Publisher, ConnectionStatus::Ended);
        self.pool.close();
        info!("Redis transport closed");
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Publisher pool sized and timed from `config`. No connection is opened here.
fn build_pool(config: &RedisConfig) -> Result<Pool, TransportError> {
    let timeout = Some(config.timeout());
    let mut pool_config = PoolConfig::new(config.pool_size.max(1));
    pool_config.timeouts = Timeouts {
        wait: timeout,
        create: timeout,
        recycle: timeout,
    };

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);
    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| TransportError::connection(format!("failed to create Redis pool: {e}")))
}

/// Open a subscriber connection, giving up after `timeout`.
async fn open_pubsub(client: &redis::Client, timeout: Duration) -> Result<redis::aio::PubSub, String> {
    match tokio::time::timeout(timeout, client.get_async_pubsub()).await {
        Ok(Ok(pubsub)) => Ok(pubsub),
        Ok(Err(e)) => Err(format!("failed to connect: {e}")),
        Err(_) => Err(format!("timed out connecting after {}ms", timeout.as_millis())),
    }
}

async fn ping(pool: &Pool) -> Result<(), String> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| format!("failed to get Redis connection: {e}"))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| format!("PING failed: {e}"))?;
    Ok(())
}

/// Why a subscriber session ended.
enum SessionEnd {
    Shutdown,
    StreamClosed,
}

enum Step {
    Shutdown,
    Closed,
    Command(SubscriberCommand),
    Message {
        pattern: Option<String>,
        channel: String,
        payload: Vec<u8>,
    },
}

/// Owns the subscriber connection for its whole lifetime.
struct SubscriberTask {
    client: redis::Client,
    commands: mpsc::Receiver<SubscriberCommand>,
    board: StatusBoard,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl SubscriberTask {
    async fn run(mut self) {
        loop {
            self.board
                .set(ConnectionRole::Subscriber, ConnectionStatus::Connecting);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = open_pubsub(&self.client, self.connect_timeout) => result,
            };

            match connected {
                Ok(mut pubsub) => {
                    info!("Redis subscriber connected");
                    self.board
                        .set(ConnectionRole::Subscriber, ConnectionStatus::Ready);

                    match self.serve(&mut pubsub).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::StreamClosed => {
                            warn!("Redis pub/sub stream ended");
                            self.board
                                .error(ConnectionRole::Subscriber, "pub/sub stream ended");
                            self.board
                                .set(ConnectionRole::Subscriber, ConnectionStatus::Closed);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to open Redis pub/sub connection");
                    self.board.error(ConnectionRole::Subscriber, e);
                }
            }

            self.board
                .set(ConnectionRole::Subscriber, ConnectionStatus::Reconnecting);
            debug!(
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "waiting before reconnecting Redis subscriber"
            );
            if !self.wait_before_reconnect().await {
                break;
            }
        }

        self.board
            .set(ConnectionRole::Subscriber, ConnectionStatus::Ended);
        info!("Redis subscriber stopped");
    }

    async fn serve(&mut self, pubsub: &mut redis::aio::PubSub) -> SessionEnd {
        loop {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    _ = self.shutdown.cancelled() => Step::Shutdown,
                    cmd = self.commands.recv() => match cmd {
                        Some(cmd) => Step::Command(cmd),
                        None => Step::Shutdown,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => Step::Message {
                            pattern: if msg.from_pattern() { msg.get_pattern().ok() } else { None },
                            channel: msg.get_channel_name().to_string(),
                            payload: msg.get_payload_bytes().to_vec(),
                        },
                        None => Step::Closed,
                    },
                }
            };

            match step {
                Step::Shutdown => return SessionEnd::Shutdown,
                Step::Closed => return SessionEnd::StreamClosed,
                Step::Message {
                    pattern,
                    channel,
                    payload,
                } => {
                    debug!(channel = %channel, pattern = ?pattern, bytes = payload.len(), "received pub/sub message");
                    match pattern {
                        Some(pattern) => self.board.pattern_message(pattern, channel, payload),
                        None => self.board.message(channel, payload),
                    }
                }
                Step::Command(SubscriberCommand::Subscribe { channel, reply }) => {
                    let result = pubsub
                        .subscribe(channel.as_str())
                        .await
                        .map_err(|e| TransportError::subscribe(&channel, e.to_string()));
                    match &result {
                        Ok(()) => info!(channel = %channel, "subscribed to Redis channel"),
                        Err(e) => warn!(channel = %channel, error = %e, "Redis subscribe failed"),
                    }
                    let _ = reply.send(result);
                }
                Step::Command(SubscriberCommand::Unsubscribe { channel, reply }) => {
                    let result = pubsub
                        .unsubscribe(channel.as_str())
                        .await
                        .map_err(|e| TransportError::unsubscribe(&channel, e.to_string()));
                    let _ = reply.send(result);
                }
                Step::Command(SubscriberCommand::PSubscribe { pattern, reply }) => {
                    let result = pubsub
                        .psubscribe(pattern.as_str())
                        .await
                        .map_err(|e| TransportError::subscribe(&pattern, e.to_string()));
                    match &result {
                        Ok(()) => info!(pattern = %pattern, "subscribed to Redis pattern"),
                        Err(e) => warn!(pattern = %pattern, error = %e, "Redis psubscribe failed"),
                    }
                    let _ = reply.send(result);
                }
                Step::Command(SubscriberCommand::PUnsubscribe { pattern, reply }) => {
                    let result = pubsub
                        .punsubscribe(pattern.as_str())
                        .await
                        .map_err(|e| TransportError::unsubscribe(&pattern, e.to_string()));
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Sleep for the reconnect delay, failing commands that arrive meanwhile.
    /// Returns `false` when the transport is shutting down.
    async fn wait_before_reconnect(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd.reject(TransportError::connection("Redis subscriber is reconnecting")),
                    None => return false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_config(url: &str) -> RedisConfig {
        RedisConfig {
            enabled: true,
            url: url.to_string(),
            pool_size: 1,
            timeout_ms: 250,
            reconnect_delay_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_pool_uses_configured_size_and_timeouts() {
        let pool = build_pool(&redis_config("redis://127.0.0.1:6379")).unwrap();

        assert_eq!(pool.status().max_size, 1);
        let timeouts = pool.timeouts();
        assert_eq!(timeouts.wait, Some(Duration::from_millis(250)));
        assert_eq!(timeouts.create, Some(Duration::from_millis(250)));
        assert_eq!(timeouts.recycle, Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_a_connection_error() {
        let err = build_pool(&redis_config("not-a-url")).unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }

    // 10.255.255.1 is unroutable: the connect either hangs until the
    // timeout or fails at once when the host has no route at all.
    #[tokio::test]
    async fn test_unresponsive_server_does_not_stall_subscriber() {
        let config = redis_config("redis://10.255.255.1:6379");
        let started = std::time::Instant::now();
        let transport = RedisTransport::connect(&config).await.unwrap();
        let mut events = transport.events();

        let error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Error {
                        role: ConnectionRole::Subscriber,
                        message,
                    }) => return message,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await
        .expect("subscriber never reported the failed connect");

        assert!(
            error.starts_with("timed out") || error.starts_with("failed to connect"),
            "unexpected error: {error}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        transport.close().await;
        assert_eq!(
            transport.status(ConnectionRole::Subscriber),
            ConnectionStatus::Ended
        );
    }
}
