//! In-process transport.
//!
//! A single shared drive keyed by URL, used by tests and demos. URLs are
//! derived from a drive id (hash of the seed) plus the entry path, so the
//! same path always resolves to the same URL for a given drive.

use super::{CreateOptions, TransportConnector, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

struct Entry {
    value: Value,
    encrypted: bool,
}

/// Shared in-memory drive.
pub struct MemoryTransport {
    drive_id: String,
    entries: RwLock<HashMap<String, Entry>>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Build a drive whose id is derived from `seed`.
    pub fn new(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        Self {
            drive_id: hex::encode(&digest[..16]),
            entries: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    fn url_for(&self, path: &str) -> String {
        format!("slash://{}{path}", self.drive_id)
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Whether the entry behind a URL was written with `encrypt`.
    pub async fn is_encrypted(&self, url: &str) -> bool {
        self.entries
            .read()
            .await
            .get(url)
            .map(|e| e.encrypted)
            .unwrap_or(false)
    }
}

#[async_trait]
impl TransportConnector for MemoryTransport {
    async fn init(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create(
        &self,
        path: &str,
        value: Value,
        opts: CreateOptions,
    ) -> Result<String, TransportError> {
        self.ensure_connected()?;
        let url = self.url_for(path);
        debug!(%url, encrypt = opts.encrypt, "transport write");
        self.entries.write().await.insert(
            url.clone(),
            Entry {
                value,
                encrypted: opts.encrypt,
            },
        );
        Ok(url)
    }

    async fn read_remote(&self, url: &str) -> Result<Option<Value>, TransportError> {
        self.ensure_connected()?;
        Ok(self.entries.read().await.get(url).map(|e| e.value.clone()))
    }

    async fn get_url(&self, path: &str) -> Result<String, TransportError> {
        self.ensure_connected()?;
        Ok(self.url_for(path))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
