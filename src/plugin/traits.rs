//! Plugin contract.
//!
//! A payment-method plugin is shipped as a module exposing `init` and
//! `get_manifest`; initialization yields a plugin instance whose
//! manifest-declared RPC methods and events are dispatched by name. Plugins
//! report progress asynchronously through a [`NotificationSender`] handed to
//! them on every invocation; they never call back into the engine directly.

use crate::storage::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Manifest `type` for payment-method plugins.
pub const PAYMENT_PLUGIN_TYPE: &str = "payment";

/// Event a payment plugin must subscribe to in order to receive funds.
pub const RECEIVE_PAYMENT_EVENT: &str = "receivePayment";

/// RPC method every payment plugin must declare.
pub const RPC_PAY: &str = "pay";

/// Optional RPC method for forwarding user-originated updates.
pub const RPC_UPDATE_PAYMENT: &str = "updatePayment";

/// Notification payload `type` values emitted by plugins.
pub mod payload_type {
    /// Plugin observed an incoming payment.
    pub const PAYMENT_NEW: &str = "payment_new";
    /// Plugin reports progress of an outgoing payment.
    pub const PAYMENT_UPDATE: &str = "payment_update";
    /// Informational completion notice.
    pub const PAYMENT_ORDER_COMPLETED: &str = "payment_order_completed";
    /// Plugin provisioned data to be written as its payment file.
    pub const READY_TO_RECEIVE: &str = "ready_to_receive";
}

/// Plugin system errors.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin init failed: {0}")]
    Init(String),

    #[error("plugin manifest retrieval failed: {0}")]
    GetManifest(String),

    #[error("plugin stop failed: {0}")]
    Stop(String),

    #[error("event dispatch failed for plugin {plugin}: {message}")]
    EventDispatch { plugin: String, message: String },

    #[error("plugin name already registered: {0}")]
    Conflict(String),

    #[error("failed to load plugin: {0}")]
    FailedToLoad(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("plugin is not active: {0}")]
    NotActive(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("rpc {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("notification channel closed")]
    CallbackClosed,
}

/// Self-description a plugin module publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// RPC method names the plugin instance implements.
    #[serde(default)]
    pub rpc: Vec<String>,
    /// Event names the plugin subscribes to.
    #[serde(default)]
    pub events: Vec<String>,
}

impl PluginManifest {
    pub fn is_payment_type(&self) -> bool {
        self.kind == PAYMENT_PLUGIN_TYPE
    }
}

/// Handle plugins use to push notification payloads back to the engine.
///
/// Cloneable and cheap; payloads are opaque JSON values routed through the
/// engine's plugin entry point.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl NotificationSender {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    /// Create a sender plus the receiving half, for driver loops and tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a payload to the engine.
    pub fn send(&self, payload: Value) -> Result<(), PluginError> {
        self.tx.send(payload).map_err(|_| PluginError::CallbackClosed)
    }
}

/// An initialized payment-method plugin.
///
/// RPC methods and events are dispatched by name, mirroring the
/// manifest-driven method table the plugin declared. `has_rpc` backs
/// manifest validation: every declared RPC name must be implemented.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Whether this instance implements the named RPC method.
    fn has_rpc(&self, method: &str) -> bool;

    /// Invoke a manifest-declared RPC method.
    ///
    /// `pay` receives `{target, payload}` and must return promptly; progress
    /// arrives through `callback` as `payment_update` payloads.
    async fn call(
        &self,
        method: &str,
        args: Value,
        callback: NotificationSender,
    ) -> Result<(), PluginError>;

    /// Deliver a manifest-declared event.
    async fn on_event(
        &self,
        event: &str,
        payload: Value,
        callback: NotificationSender,
    ) -> Result<(), PluginError> {
        let _ = (event, payload, callback);
        Ok(())
    }

    /// Graceful shutdown hook.
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// A loadable plugin module: constructor plus manifest.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Initialize the plugin with access to the engine store.
    async fn init(&self, storage: Arc<Store>) -> Result<Arc<dyn Plugin>, PluginError>;

    /// The module's self-description, validated before registration.
    async fn get_manifest(&self) -> Result<PluginManifest, PluginError>;
}
