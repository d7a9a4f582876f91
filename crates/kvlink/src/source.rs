//! Where settings come from.
//!
//! The registry depends on two small traits: a [`SourceProvider`] that
//! opens the source on first use, and the [`SettingSource`] it yields,
//! which resolves router names and announces configuration changes.
//!
//! [`TomlSettingSource`] is the bundled implementation. Its document is a
//! set of top-level tables keyed by router name:
//!
//! ```toml
//! [default_redis]
//! RouterName = "default_redis"
//! Type = "master"
//! Url = "127.0.0.1:6379"
//! ReadTimeout = 0
//! ```
//!
//! Every table's `Type` is validated when the document is loaded; an
//! unsupported mode rejects the whole document. The rest of a table is
//! decoded lazily, when its router is first resolved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::error::SourceError;
use crate::setting::{ConnectionMode, Setting};

/// Resolves router names to settings and announces changes.
pub trait SettingSource: Send + Sync {
    /// Decode the setting for `key`.
    fn resolve(&self, key: &str) -> Result<Setting, SourceError>;

    /// Change notifications. The value is an opaque version; a fresh
    /// receiver has already seen the current one, so a quiet source never
    /// wakes it.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Opens a [`SettingSource`]. Called lazily. An unreachable source is
/// retried on the next registry call; an unsupported `Type` is not.
pub trait SourceProvider: Send + Sync {
    fn open(&self) -> Result<Arc<dyn SettingSource>, SourceError>;
}

impl<F> SourceProvider for F
where
    F: Fn() -> Result<Arc<dyn SettingSource>, SourceError> + Send + Sync,
{
    fn open(&self) -> Result<Arc<dyn SettingSource>, SourceError> {
        self()
    }
}

/// Opens a [`TomlSettingSource`] backed by a file.
#[derive(Clone, Debug)]
pub struct FileSourceProvider {
    path: PathBuf,
}

impl FileSourceProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceProvider for FileSourceProvider {
    fn open(&self) -> Result<Arc<dyn SettingSource>, SourceError> {
        Ok(Arc::new(TomlSettingSource::from_file(&self.path)?))
    }
}

/// Validated-but-undecoded router tables.
type Document = HashMap<String, toml::Value>;

fn parse_document(content: &str) -> Result<Document, SourceError> {
    let table: toml::Table = toml::from_str(content).map_err(|e| SourceError::Parse(e.to_string()))?;
    let mut document = Document::with_capacity(table.len());
    for (key, value) in table {
        let mode = value
            .as_table()
            .ok_or_else(|| SourceError::Decode {
                key: key.clone(),
                reason: "expected a table".to_string(),
            })?
            .get("Type")
            .and_then(toml::Value::as_str)
            .ok_or_else(|| SourceError::Decode {
                key: key.clone(),
                reason: "missing string field 'Type'".to_string(),
            })?;
        if ConnectionMode::parse(mode).is_none() {
            return Err(SourceError::UnsupportedMode {
                key,
                mode: mode.to_string(),
            });
        }
        document.insert(key, value);
    }
    Ok(document)
}

/// Settings held in memory, loaded from TOML.
pub struct TomlSettingSource {
    path: Option<PathBuf>,
    document: RwLock<Document>,
    version: watch::Sender<u64>,
}

impl std::fmt::Debug for TomlSettingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TomlSettingSource")
            .field("path", &self.path)
            .field("version", &*self.version.borrow())
            .finish_non_exhaustive()
    }
}

impl TomlSettingSource {
    fn with_document(path: Option<PathBuf>, document: Document) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            path,
            document: RwLock::new(document),
            version,
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SourceError> {
        Ok(Self::with_document(None, parse_document(content)?))
    }

    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let content = std::fs::read_to_string(path)?;
        let document = parse_document(&content)?;
        tracing::info!(path = %path.display(), routers = document.len(), "loaded settings");
        Ok(Self::with_document(Some(path.to_path_buf()), document))
    }

    /// Replace the document and notify subscribers.
    ///
    /// A document that fails to load leaves the current one in place and
    /// notifies nobody.
    pub fn reload_from_str(&self, content: &str) -> Result<(), SourceError> {
        let document = parse_document(content)?;
        let routers = document.len();
        *self.document.write().unwrap_or_else(|e| e.into_inner()) = document;
        self.version.send_modify(|v| *v += 1);
        tracing::info!(routers, version = *self.version.borrow(), "settings reloaded");
        Ok(())
    }

    /// Re-read the backing file.
    pub fn reload(&self) -> Result<(), SourceError> {
        let path = self.path.as_ref().ok_or_else(|| {
            SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "settings source has no backing file",
            ))
        })?;
        let content = std::fs::read_to_string(path)?;
        self.reload_from_str(&content)
    }

    /// Current document version; bumped by every successful reload.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Router names in the current document, sorted.
    pub fn keys(&self) -> Vec<String> {
        let document = self.document.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = document.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl SettingSource for TomlSettingSource {
    fn resolve(&self, key: &str) -> Result<Setting, SourceError> {
        let value = {
            let document = self.document.read().unwrap_or_else(|e| e.into_inner());
            document
                .get(key)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(key.to_string()))?
        };
        let mut setting: Setting = value.try_into().map_err(|e: toml::de::Error| SourceError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if setting.router_name.is_empty() {
            setting.router_name = key.to_string();
        }
        Ok(setting)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}
