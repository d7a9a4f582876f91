//! Live client handles.
//!
//! A [`RedisClient`] wraps a `redis` crate client and one multiplexed
//! [`ConnectionManager`] to its node. The manager is cheap to clone and
//! pipelines every clone's commands over the same socket, reconnecting on
//! its own when the link drops, so a single `Arc<RedisClient>` can be
//! shared by every caller of the registry for that router name.
//!
//! A [`ClusterClient`] groups one `RedisClient` per seed node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{ConnectionInfo, FromRedisValue, IntoConnectionInfo};

use crate::endpoint::Endpoint;
use crate::error::ClientError;

/// Dial timeout used when a setting leaves `DialTimeout` unset.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-command timeout used when a setting leaves the I/O timeouts unset.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection parameters for a [`RedisClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientOptions {
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout: Duration,
    /// Bound on one command round trip.
    pub response_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            password: None,
            db: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

fn connection_info(endpoint: &Endpoint, options: &ClientOptions) -> redis::RedisResult<ConnectionInfo> {
    let mut info = endpoint.to_string().into_connection_info()?;
    info.redis.db = options.db;
    info.redis.password = options.password.clone();
    Ok(info)
}

/// Shared handle to one store node.
pub struct RedisClient {
    id: u64,
    endpoint: Endpoint,
    options: ClientOptions,
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
    connecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("db", &self.options.db)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RedisClient {
    /// Create a client. Nothing is dialed until [`connection`](Self::connection)
    /// is first awaited.
    pub fn open(endpoint: Endpoint, options: ClientOptions) -> Result<Self, ClientError> {
        let info = connection_info(&endpoint, &options).map_err(|e| ClientError::Connect(e.to_string()))?;
        let client = redis::Client::open(info).map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            options,
            client,
            manager: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Process-unique id, handy for telling handles apart in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the shared connection has been established.
    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ConnectionManager>> {
        self.manager.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Result<Option<ConnectionManager>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self.slot().clone())
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        // A refused dial fails the caller instead of backing off in place.
        ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(self.options.connect_timeout)
            .set_response_timeout(self.options.response_timeout)
    }

    /// The shared multiplexed connection, dialed on first use.
    ///
    /// Concurrent first callers wait for one dial. Every caller gets its own
    /// clone; commands from all clones share the socket.
    pub async fn connection(&self) -> Result<ConnectionManager, ClientError> {
        if let Some(manager) = self.current()? {
            return Ok(manager);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(manager) = self.current()? {
            return Ok(manager);
        }

        let manager = ConnectionManager::new_with_config(self.client.clone(), self.manager_config())
            .await
            .map_err(|e| ClientError::Connect(format!("{}: {e}", self.endpoint)))?;

        let mut slot = self.slot();
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        *slot = Some(manager.clone());
        tracing::debug!(client = self.id, endpoint = %self.endpoint, "connected");
        Ok(manager)
    }

    /// Run one command on the shared connection.
    pub async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, ClientError> {
        let mut conn = self.connection().await?;
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| ClientError::Command(e.to_string()))
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply != "PONG" {
            return Err(ClientError::Command(format!("unexpected PING reply '{reply}'")));
        }
        Ok(())
    }

    /// Refuse further use and drop the shared connection.
    ///
    /// Clones already handed out keep working until their holders drop
    /// them. Calling `close` again is a no-op.
    pub fn close(&self) {
        let manager = {
            let mut slot = self.slot();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };
        drop(manager);
        tracing::debug!(client = self.id, endpoint = %self.endpoint, "client closed");
    }
}

/// Handle for a cluster router: one client per seed node.
#[derive(Debug)]
pub struct ClusterClient {
    nodes: Vec<Arc<RedisClient>>,
}

impl ClusterClient {
    pub fn new(nodes: Vec<Arc<RedisClient>>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Arc<RedisClient>] {
        &self.nodes
    }

    /// Ping every node; the first failure wins.
    pub async fn ping(&self) -> Result<(), ClientError> {
        for node in &self.nodes {
            node.ping().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.nodes.iter().all(|n| n.is_closed())
    }

    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}
