//! Generic key-value persistence for client state across restarts.
//!
//! Backed by a small JSON object on disk. Used for the portal session token,
//! which must survive restarts but is safe to lose (the portal simply hands
//! out a new anonymous session).

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Key under which the portal session token is persisted.
pub const KV_SESSION: &str = "session";

pub struct KvStore {
    /// `None` for in-memory stores that never touch disk.
    path: Option<PathBuf>,
    values: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    /// Open the store at `path`. A missing file is treated as an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse key-value store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Key-value store not found, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read key-value store {}", path.display()));
            }
        };

        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    /// Retrieve a value by key, or `None` if not present.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.values.lock().await.get(key).cloned()
    }

    /// Insert or update a key-value pair and flush the store to disk.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_owned(), value.to_owned());

        let Some(path) = &self.path else {
            return Ok(());
        };

        let raw = serde_json::to_string_pretty(&*values)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write key-value store {}", path.display()))
    }
}
