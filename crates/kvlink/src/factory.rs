//! Turning a [`Setting`] into a live, probed client.
//!
//! The registry only talks to the [`ClientFactory`] trait so tests can
//! count and script client creation. [`RedisClientFactory`] is the
//! production implementation: it opens a `redis` client for the setting's
//! address (TLS for `rediss://`), with the password and database applied
//! on every connection, and refuses to hand out a client whose first
//! `PING` fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ClientOptions, ClusterClient, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, RedisClient};
use crate::error::{ClientError, FactoryError};
use crate::setting::Setting;

/// Builds client handles from settings.
///
/// Implementations must not retain the handles they create; the registry
/// alone decides whether a fresh handle is kept or retired.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a single-node client and prove it can round-trip a `PING`.
    async fn create(&self, setting: &Setting) -> Result<Arc<RedisClient>, FactoryError>;

    /// Build a cluster client. Unsupported unless a factory opts in.
    async fn create_cluster(&self, _setting: &Setting) -> Result<Arc<ClusterClient>, FactoryError> {
        Err(FactoryError::Unimplemented("cluster mode"))
    }
}

fn or_default(d: Duration, default: Duration) -> Duration {
    if d.is_zero() { default } else { d }
}

/// Client options derived from a setting's effective values.
pub fn client_options(setting: &Setting) -> ClientOptions {
    let io = setting.read_timeout().max(setting.write_timeout());
    ClientOptions {
        password: (!setting.password().is_empty()).then(|| setting.password().to_string()),
        db: setting.db,
        connect_timeout: or_default(setting.dial_timeout(), DEFAULT_CONNECT_TIMEOUT),
        response_timeout: or_default(io, DEFAULT_RESPONSE_TIMEOUT),
    }
}

/// Dial `client` and round-trip a `PING`.
pub async fn probe(client: &RedisClient) -> Result<(), FactoryError> {
    client.connection().await.map_err(|e| match e {
        ClientError::Connect(reason) => FactoryError::Connect(reason),
        other => FactoryError::Connect(other.to_string()),
    })?;
    client.ping().await.map_err(|e| FactoryError::Probe(e.to_string()))
}

/// Production factory dialing real store nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RedisClientFactory;

impl RedisClientFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for RedisClientFactory {
    async fn create(&self, setting: &Setting) -> Result<Arc<RedisClient>, FactoryError> {
        let endpoint = setting.endpoint().map_err(FactoryError::Connect)?;
        let options = client_options(setting);
        let client = RedisClient::open(endpoint, options).map_err(|e| FactoryError::Connect(e.to_string()))?;
        probe(&client).await?;

        tracing::debug!(
            router = %setting.router_name,
            client = client.id(),
            endpoint = %client.endpoint(),
            db = setting.db,
            read_only = setting.is_read_only(),
            "created client"
        );
        Ok(Arc::new(client))
    }
}
