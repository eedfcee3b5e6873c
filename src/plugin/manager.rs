//! Plugin manager.
//!
//! Holds the registry of loaded plugins, validates manifests on the way in,
//! fans events out to subscribed plugins, and exposes RPC lookup. Registry
//! writers take exclusive access; dispatch and lookup read concurrently.

use crate::plugin::traits::{
    NotificationSender, Plugin, PluginError, PluginManifest, PluginModule, PAYMENT_PLUGIN_TYPE,
    RECEIVE_PAYMENT_EVENT, RPC_PAY,
};
use crate::storage::Store;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One loaded plugin: manifest, instance, and lifecycle flag.
#[derive(Clone)]
pub struct RegistryEntry {
    pub manifest: PluginManifest,
    pub plugin: Arc<dyn Plugin>,
    pub active: bool,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("manifest", &self.manifest)
            .field("active", &self.active)
            .finish()
    }
}

/// Invocable handle from the RPC registry.
#[derive(Clone)]
pub struct RpcHandle {
    pub plugin: Arc<dyn Plugin>,
    pub method: String,
}

impl RpcHandle {
    /// Dispatch the registered method on its plugin.
    pub async fn invoke(
        &self,
        args: Value,
        callback: NotificationSender,
    ) -> Result<(), PluginError> {
        self.plugin.call(&self.method, args, callback).await
    }
}

/// Registry of named plugins plus event dispatcher and RPC namespace.
pub struct PluginManager {
    /// Configured plugin table: entry point (name or path) -> module.
    modules: RwLock<HashMap<String, Arc<dyn PluginModule>>>,
    /// Loaded plugins by manifest name.
    registry: RwLock<HashMap<String, RegistryEntry>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Register a loadable module under an entry point (a plugin name or a
    /// path-like alias). This is the configured plugin table that
    /// [`load_plugin`](Self::load_plugin) resolves against.
    pub async fn register_module(&self, entry_point: impl Into<String>, module: Arc<dyn PluginModule>) {
        self.modules.write().await.insert(entry_point.into(), module);
    }

    /// Resolve an entry point against the configured plugin table and load
    /// it. On any resolution or manifest failure, already-loaded plugins are
    /// stopped before the error is surfaced.
    pub async fn load_plugin(
        &self,
        entry_point: &str,
        storage: Arc<Store>,
    ) -> Result<RegistryEntry, PluginError> {
        let module = { self.modules.read().await.get(entry_point).cloned() };
        let Some(module) = module else {
            return Err(self
                .graceful_throw(PluginError::FailedToLoad(entry_point.to_string()))
                .await);
        };

        match self.inject_plugin(module, storage).await {
            Ok(entry) => Ok(entry),
            Err(err @ PluginError::GetManifest(_)) => Err(self.graceful_throw(err).await),
            Err(err) => Err(err),
        }
    }

    /// Initialize a module, validate its manifest, and register the plugin.
    pub async fn inject_plugin(
        &self,
        module: Arc<dyn PluginModule>,
        storage: Arc<Store>,
    ) -> Result<RegistryEntry, PluginError> {
        let plugin = module
            .init(storage)
            .await
            .map_err(|e| PluginError::Init(e.to_string()))?;
        let manifest = module
            .get_manifest()
            .await
            .map_err(|e| PluginError::GetManifest(e.to_string()))?;

        validate_manifest(&manifest, plugin.as_ref())?;

        let mut registry = self.registry.write().await;
        // Names are unique across active and inactive entries.
        if registry.contains_key(&manifest.name) {
            return Err(PluginError::Conflict(manifest.name.clone()));
        }

        let entry = RegistryEntry {
            manifest: manifest.clone(),
            plugin,
            active: true,
        };
        registry.insert(manifest.name.clone(), entry.clone());
        info!(plugin = %manifest.name, "plugin registered");
        Ok(entry)
    }

    /// Stop a plugin and mark it inactive. The entry stays in the registry
    /// until [`remove_plugin`](Self::remove_plugin).
    pub async fn stop_plugin(&self, name: &str) -> Result<(), PluginError> {
        let plugin = {
            let registry = self.registry.read().await;
            registry
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?
                .plugin
                .clone()
        };

        let result = plugin
            .stop()
            .await
            .map_err(|e| PluginError::Stop(e.to_string()));

        if let Some(entry) = self.registry.write().await.get_mut(name) {
            entry.active = false;
        }
        info!(plugin = %name, "plugin stopped");
        result
    }

    /// Remove an inactive plugin from the registry. Refuses (returns false)
    /// while the entry is still active.
    pub async fn remove_plugin(&self, name: &str) -> bool {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get(name) {
            if entry.active {
                return false;
            }
        }
        registry.remove(name);
        true
    }

    /// Registry snapshot, optionally filtered by active flag.
    pub async fn get_plugins(&self, is_active: Option<bool>) -> Vec<RegistryEntry> {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|entry| is_active.map_or(true, |active| entry.active == active))
            .cloned()
            .collect()
    }

    /// Look up a single registry entry by name.
    pub async fn get_plugin(&self, name: &str) -> Option<RegistryEntry> {
        self.registry.read().await.get(name).cloned()
    }

    /// Deliver an event to every active plugin subscribed to it.
    ///
    /// All deliveries run concurrently and are joined before returning; a
    /// failing plugin is logged and never aborts the others.
    pub async fn dispatch_event(&self, event: &str, data: Value, callback: NotificationSender) {
        let targets: Vec<(String, Arc<dyn Plugin>)> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|e| e.active && e.manifest.events.iter().any(|ev| ev == event))
                .map(|e| (e.manifest.name.clone(), e.plugin.clone()))
                .collect()
        };

        debug!(event = %event, targets = targets.len(), "dispatching event");

        let deliveries = targets.into_iter().map(|(name, plugin)| {
            let data = data.clone();
            let callback = callback.clone();
            let event = event.to_string();
            async move {
                if let Err(e) = plugin.on_event(&event, data, callback).await {
                    let err = PluginError::EventDispatch {
                        plugin: name,
                        message: e.to_string(),
                    };
                    warn!("{err}");
                }
            }
        });
        join_all(deliveries).await;
    }

    /// Mapping `"{pluginName}/{method}" -> handle` over all loaded plugins.
    pub async fn get_rpc_registry(&self) -> HashMap<String, RpcHandle> {
        let registry = self.registry.read().await;
        let mut out = HashMap::new();
        for entry in registry.values() {
            for method in &entry.manifest.rpc {
                out.insert(
                    format!("{}/{}", entry.manifest.name, method),
                    RpcHandle {
                        plugin: entry.plugin.clone(),
                        method: method.clone(),
                    },
                );
            }
        }
        out
    }

    /// Stop every registered plugin sequentially, then hand the error back
    /// for re-raising.
    pub async fn graceful_throw(&self, err: PluginError) -> PluginError {
        warn!("stopping all plugins before surfacing error: {err}");
        let names: Vec<String> = {
            let registry = self.registry.read().await;
            registry.keys().cloned().collect()
        };
        for name in names {
            if let Err(stop_err) = self.stop_plugin(&name).await {
                warn!(plugin = %name, "stop during graceful shutdown failed: {stop_err}");
            }
        }
        err
    }

    /// Stop all active plugins (engine shutdown).
    pub async fn shutdown(&self) {
        info!("shutting down plugin manager");
        let names: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .filter(|(_, e)| e.active)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            if let Err(e) = self.stop_plugin(&name).await {
                warn!(plugin = %name, "error stopping plugin: {e}");
            }
        }
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a manifest against the plugin instance it describes.
fn validate_manifest(manifest: &PluginManifest, plugin: &dyn Plugin) -> Result<(), PluginError> {
    if manifest.name.trim().is_empty() {
        return Err(PluginError::InvalidManifest(
            "name must be a non-empty string".into(),
        ));
    }

    let mut seen = HashSet::new();
    for method in &manifest.rpc {
        if method.trim().is_empty() {
            return Err(PluginError::InvalidManifest(format!(
                "{}: rpc entries must be non-empty strings",
                manifest.name
            )));
        }
        if !seen.insert(method.as_str()) {
            return Err(PluginError::InvalidManifest(format!(
                "{}: duplicate rpc entry {method}",
                manifest.name
            )));
        }
        if !plugin.has_rpc(method) {
            return Err(PluginError::InvalidManifest(format!(
                "{}: declared rpc {method} is not implemented",
                manifest.name
            )));
        }
    }

    let mut seen_events = HashSet::new();
    for event in &manifest.events {
        if !seen_events.insert(event.as_str()) {
            return Err(PluginError::InvalidManifest(format!(
                "{}: duplicate event {event}",
                manifest.name
            )));
        }
    }

    if manifest.is_payment_type() {
        if !manifest.rpc.iter().any(|m| m == RPC_PAY) {
            return Err(PluginError::InvalidManifest(format!(
                "{}: {PAYMENT_PLUGIN_TYPE} plugins must declare {RPC_PAY} in rpc",
                manifest.name
            )));
        }
        if !manifest.events.iter().any(|e| e == RECEIVE_PAYMENT_EVENT) {
            return Err(PluginError::InvalidManifest(format!(
                "{}: {PAYMENT_PLUGIN_TYPE} plugins must subscribe to {RECEIVE_PAYMENT_EVENT}",
                manifest.name
            )));
        }
    }

    Ok(())
}
