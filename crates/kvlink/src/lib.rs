//! kvlink: lazily created, shared key-value store clients keyed by router
//! name.
//!
//! Application code asks a [`Registry`] for the client behind a logical
//! router name such as `"default_redis"`. The registry resolves the name
//! through a [`SettingSource`], builds and probes a client on first use,
//! and hands the same `Arc` to every later caller. When the settings
//! change, every cached client is retired: it keeps working for a grace
//! period and is then closed by a background sweep.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── SourceProvider ──open once──▶ SettingSource (TOML, hot-reloadable)
//!   │                                   └── change notifications ──▶ invalidation listener
//!   ├── live maps: router name → Arc<RedisClient> / Arc<ClusterClient>
//!   ├── ClientFactory ──▶ RedisClient (redis::Client + multiplexed ConnectionManager)
//!   └── RetirementQueue ◀── invalidate_all
//!         └── sweeper closes entries older than the grace period
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use kvlink::{Registry, RegistryConfig};
//!
//! let config = RegistryConfig::from_file(std::path::Path::new("conf/kvlink.toml"))?;
//! let registry = Registry::from_config(config)?;
//! let client = registry.get("default_redis").await?;
//! client.ping().await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod factory;
mod listener;
pub mod registry;
pub mod retirement;
pub mod setting;
pub mod source;

pub use client::{ClientOptions, ClusterClient, RedisClient};
pub use config::RegistryConfig;
pub use endpoint::Endpoint;
pub use error::{ClientError, FactoryError, RegistryError, RegistryResult, SourceError};
pub use factory::{ClientFactory, RedisClientFactory};
pub use registry::{Registry, RegistryStats};
pub use retirement::{RetiredClient, RetirementQueue};
pub use setting::{ConnectionMode, Setting};
pub use source::{FileSourceProvider, SettingSource, SourceProvider, TomlSettingSource};
