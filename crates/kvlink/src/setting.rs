//! Per-router connection settings.
//!
//! A [`Setting`] is decoded from the settings source using the field names
//! of the deployed configuration (`RouterName`, `Type`, `Url`, ...). Raw
//! numeric fields are kept exactly as configured; the effective values are
//! computed the first time any numeric accessor runs and cached for the
//! life of the setting.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

/// Read/write timeouts below this are raised to it.
pub const MIN_IO_TIMEOUT_MS: i64 = 200;

/// How the router's target is deployed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Single node, read-write.
    #[serde(rename = "master")]
    Master,
    /// Single node, read-only replica.
    #[serde(rename = "slaver")]
    Replica,
    /// Cluster; served by `Registry::get_cluster` only.
    #[serde(rename = "cluster")]
    Cluster,
}

impl ConnectionMode {
    pub const ALL: [ConnectionMode; 3] = [Self::Master, Self::Replica, Self::Cluster];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Replica => "slaver",
            Self::Cluster => "cluster",
        }
    }

    /// Parse the configured `Type` value.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }

    pub fn is_cluster(self) -> bool {
        self == Self::Cluster
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defaulted numeric values; zero means "use the client default".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Effective {
    pub pool_size: usize,
    pub min_idle_conns: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_check_frequency: Duration,
}

fn clamp_count(v: i64) -> usize {
    usize::try_from(v.max(0)).unwrap_or(usize::MAX)
}

fn clamp_secs(v: i64) -> Duration {
    Duration::from_secs(v.max(0).unsigned_abs())
}

/// `<= 0` stays unset; anything else is floored at [`MIN_IO_TIMEOUT_MS`].
fn floor_io_ms(v: i64) -> Option<Duration> {
    (v > 0).then(|| Duration::from_millis(v.max(MIN_IO_TIMEOUT_MS).unsigned_abs()))
}

impl Effective {
    fn from_raw(s: &Setting) -> Self {
        let read_timeout = floor_io_ms(s.read_timeout).unwrap_or(Duration::ZERO);
        Self {
            pool_size: clamp_count(s.pool_size),
            min_idle_conns: clamp_count(s.min_idle_conns),
            dial_timeout: clamp_secs(s.dial_timeout),
            read_timeout,
            write_timeout: floor_io_ms(s.write_timeout).unwrap_or(read_timeout),
            idle_timeout: clamp_secs(s.idle_timeout),
            idle_check_frequency: clamp_secs(s.idle_check_frequency),
        }
    }
}

/// Connection target for one logical router name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Setting {
    #[serde(rename = "RouterName", default)]
    pub router_name: String,
    #[serde(rename = "Type")]
    pub mode: ConnectionMode,
    /// `host:port`, optionally `redis://` / `rediss://` prefixed. Cluster
    /// settings list seed nodes separated by commas.
    #[serde(rename = "Url", default)]
    pub url: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "DB", default)]
    pub db: i64,
    #[serde(rename = "PoolSize", default)]
    pub pool_size: i64,
    #[serde(rename = "MinIdleConns", default)]
    pub min_idle_conns: i64,
    /// Seconds.
    #[serde(rename = "DialTimeout", default)]
    pub dial_timeout: i64,
    /// Milliseconds.
    #[serde(rename = "ReadTimeout", default)]
    pub read_timeout: i64,
    /// Milliseconds.
    #[serde(rename = "WriteTimeout", default)]
    pub write_timeout: i64,
    /// Seconds.
    #[serde(rename = "IdleTimeout", default)]
    pub idle_timeout: i64,
    /// Seconds.
    #[serde(rename = "IdleCheckFrequency", default)]
    pub idle_check_frequency: i64,
    #[serde(skip)]
    effective: OnceLock<Effective>,
}

impl Setting {
    pub fn new(router_name: &str, mode: ConnectionMode, url: &str) -> Self {
        Self {
            router_name: router_name.to_string(),
            mode,
            url: url.to_string(),
            password: String::new(),
            db: 0,
            pool_size: 0,
            min_idle_conns: 0,
            dial_timeout: 0,
            read_timeout: 0,
            write_timeout: 0,
            idle_timeout: 0,
            idle_check_frequency: 0,
            effective: OnceLock::new(),
        }
    }

    /// Effective numeric values, computed on first use.
    pub fn effective(&self) -> &Effective {
        self.effective.get_or_init(|| Effective::from_raw(self))
    }

    /// Whether defaulting has already run for this setting.
    pub fn is_defaulted(&self) -> bool {
        self.effective.get().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == ConnectionMode::Replica
    }

    pub fn addr(&self) -> &str {
        &self.url
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn pool_size(&self) -> usize {
        self.effective().pool_size
    }

    pub fn min_idle_conns(&self) -> usize {
        self.effective().min_idle_conns
    }

    pub fn dial_timeout(&self) -> Duration {
        self.effective().dial_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.effective().read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.effective().write_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.effective().idle_timeout
    }

    pub fn idle_check_frequency(&self) -> Duration {
        self.effective().idle_check_frequency
    }

    /// The single dial target for master/replica settings.
    pub fn endpoint(&self) -> Result<Endpoint, String> {
        Endpoint::parse(&self.url)
    }

    /// Seed nodes for a cluster setting (comma-separated `Url`).
    pub fn seed_endpoints(&self) -> Result<Vec<Endpoint>, String> {
        let seeds = self
            .url
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Endpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if seeds.is_empty() {
            return Err(format!("no seed nodes in url '{}'", self.url));
        }
        Ok(seeds)
    }
}
