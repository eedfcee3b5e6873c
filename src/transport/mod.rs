//! Transport contract.
//!
//! The engine publishes and reads endpoint catalogues through a minimal
//! key/value-over-URL store (a signed web drive in production). Only this
//! interface is consumed; the concrete drive, its signing, and its
//! encryption all live behind it.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Canonical catalogue file name.
pub const PAYMENT_FILE: &str = "slashpay.json";

/// Path of the public endpoint index.
pub fn public_index_path() -> String {
    format!("/public/{PAYMENT_FILE}")
}

/// Path of a plugin's public payment file.
pub fn public_plugin_path(plugin_name: &str) -> String {
    format!("/public/slashpay/{plugin_name}/{PAYMENT_FILE}")
}

/// Path of a private (per-invoice) endpoint index.
pub fn invoice_index_path(client_order_id: &str) -> String {
    format!("/slashpay/{client_order_id}/{PAYMENT_FILE}")
}

/// Path of a plugin's private payment file for an invoice.
pub fn invoice_plugin_path(client_order_id: &str, plugin_name: &str) -> String {
    format!("/slashpay/{client_order_id}/{plugin_name}/{PAYMENT_FILE}")
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport i/o error: {0}")]
    Io(String),

    #[error("malformed url: {0}")]
    MalformedUrl(String),
}

/// Options for [`TransportConnector::create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Block until the write is visible through the relay.
    pub await_relay_sync: bool,
    /// Encrypt the value at rest; readers need the drive secret.
    pub encrypt: bool,
}

impl CreateOptions {
    pub fn synced() -> Self {
        Self {
            await_relay_sync: true,
            encrypt: false,
        }
    }

    pub fn encrypted() -> Self {
        Self {
            await_relay_sync: true,
            encrypt: true,
        }
    }
}

/// Minimal key/value-over-URL store consumed by the engine.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect the underlying drive.
    async fn init(&self) -> Result<(), TransportError>;

    /// Write `value` at `path`, returning the public URL of the entry.
    async fn create(
        &self,
        path: &str,
        value: Value,
        opts: CreateOptions,
    ) -> Result<String, TransportError>;

    /// Read the value behind a URL; `None` when nothing is stored there.
    async fn read_remote(&self, url: &str) -> Result<Option<Value>, TransportError>;

    /// URL a path would be published under, without writing.
    async fn get_url(&self, path: &str) -> Result<String, TransportError>;

    /// Disconnect.
    async fn close(&self) -> Result<(), TransportError>;
}
