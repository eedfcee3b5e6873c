//! Payment sender.
//!
//! A sender is a short-lived coordinator for one order: it asks the order
//! for the in-flight payment, resolves the counterparty's endpoint for the
//! currently selected plugin, invokes the plugin's `pay`, and reacts to the
//! asynchronous plugin callbacks by completing, retrying with the next
//! plugin, or reporting a final failure. Callbacks are expected to arrive
//! through a single driver loop; the sender itself is never shared across
//! tasks.

use crate::payment::order::{OrderError, PaymentOrder};
use crate::payment::PaymentError;
use crate::plugin::traits::payload_type;
use crate::plugin::{NotificationSender, PluginError, PluginManager, RegistryEntry, RPC_PAY, RPC_UPDATE_PAYMENT};
use crate::storage::Store;
use crate::transport::{TransportConnector, TransportError};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reason recorded on a payment when the counterparty publishes no usable
/// endpoint for the selected plugin.
pub const PAYMENT_TARGET_NOT_FOUND: &str = "PAYMENT_TARGET_NOT_FOUND";

/// Reported to the user when every plugin in the priority has been tried.
pub const NO_PLUGINS_AVAILABLE: &str = "NO_PLUGINS_AVAILABLE";

/// Send-path errors.
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("no plugins available for payment")]
    NoPluginsAvailable,

    #[error("no payment is in progress")]
    NoPaymentInProgress,

    #[error("plugin is not active: {0}")]
    PluginNotActive(String),

    #[error("payment target not found")]
    PaymentTargetNotFound,

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the driver loop should do after a callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderFlow {
    /// More plugin callbacks are expected.
    Continue,
    /// The payment settled (completed or finally failed); stop driving.
    Settled,
}

/// Per-order send coordinator.
pub struct PaymentSender {
    order: PaymentOrder,
    store: Arc<Store>,
    plugin_manager: Arc<PluginManager>,
    transport: Arc<dyn TransportConnector>,
    /// Handed to plugins on every invocation; routes back into the engine's
    /// plugin entry point.
    plugin_callback: NotificationSender,
    /// Outward reports: completion, final failure, action-required states.
    notifier: NotificationSender,
}

impl PaymentSender {
    pub fn new(
        order: PaymentOrder,
        store: Arc<Store>,
        plugin_manager: Arc<PluginManager>,
        transport: Arc<dyn TransportConnector>,
        plugin_callback: NotificationSender,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            order,
            store,
            plugin_manager,
            transport,
            plugin_callback,
            notifier,
        }
    }

    /// The order's id, once initialized.
    pub fn order_id(&self) -> Option<uuid::Uuid> {
        self.order.id
    }

    /// Engage the current payment's selected plugin and invoke `pay`.
    ///
    /// Endpoint-resolution failures are treated as plugin failures: the
    /// attempt is recorded as failed and the next plugin in the priority is
    /// tried. Exhausting the priority surfaces
    /// [`SenderError::NoPluginsAvailable`].
    pub async fn submit(&mut self) -> Result<(), SenderError> {
        loop {
            let store = self.store.clone();
            let Some(payment) = self.order.process(&store).await? else {
                debug!("order has no actionable payment left");
                return Ok(());
            };

            let Some(run) = payment.get_current_plugin() else {
                return Err(SenderError::NoPluginsAvailable);
            };
            let plugin_name = run.name.clone();
            let entry = Self::plugin_entry(&self.plugin_manager, &store, &plugin_name).await?;

            let counterparty_url = payment.counterparty_url.clone();
            match Self::resolve_target(&*self.transport, &counterparty_url, &plugin_name).await {
                Ok(target) => {
                    let args = json!({
                        "target": target,
                        "payload": payment.plugin_payload()?,
                    });
                    info!(plugin = %plugin_name, payment = ?payment.id, "invoking pay");
                    entry
                        .plugin
                        .call(RPC_PAY, args, self.plugin_callback.clone())
                        .await?;
                    return Ok(());
                }
                Err(SenderError::PaymentTargetNotFound) => {
                    warn!(plugin = %plugin_name, "payment target not found, trying next plugin");
                    payment.plugin_update = Some(json!({
                        "pluginName": plugin_name,
                        "pluginState": "failed",
                        "reason": PAYMENT_TARGET_NOT_FOUND,
                    }));
                    payment.update(&store, None).await?;
                    payment.fail_current_plugin(&store).await?;
                    // Loop: the order hands back the same payment, which
                    // engages the next pending plugin.
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle an asynchronous plugin callback for this order.
    ///
    /// Callbacks arriving after the payment settled are logged and dropped.
    pub async fn state_update_callback(&mut self, update: Value) -> Result<SenderFlow, SenderError> {
        let store = self.store.clone();
        let Some(payment) = self
            .order
            .payments
            .iter_mut()
            .find(|p| p.is_in_progress())
        else {
            warn!("dropping plugin callback, no payment in progress: {update}");
            return Ok(SenderFlow::Continue);
        };

        payment.plugin_update = Some(update.clone());
        payment.update(&store, None).await?;

        match update.get("pluginState").and_then(Value::as_str) {
            Some("failed") => self.handle_failure(update).await,
            Some("success") => self.handle_success().await,
            _ => {
                // Intermediate state (e.g. user action required); surface the
                // payment and keep waiting.
                let payment = self
                    .order
                    .payments
                    .iter()
                    .find(|p| p.is_in_progress())
                    .expect("payment checked above");
                self.notify(json!({
                    "type": payload_type::PAYMENT_UPDATE,
                    "update": update,
                    "payment": payment.serialize()?,
                }));
                Ok(SenderFlow::Continue)
            }
        }
    }

    /// Forward a user-originated update to the in-flight payment's plugin.
    pub async fn update_payment(&mut self, data: Value) -> Result<(), SenderError> {
        let payment = self
            .order
            .payments
            .iter()
            .find(|p| p.is_in_progress())
            .ok_or(SenderError::NoPaymentInProgress)?;
        let run = payment
            .get_current_plugin()
            .ok_or(SenderError::NoPluginsAvailable)?;

        let entry = Self::plugin_entry(&self.plugin_manager, &self.store, &run.name).await?;
        entry
            .plugin
            .call(RPC_UPDATE_PAYMENT, data, self.plugin_callback.clone())
            .await?;
        Ok(())
    }

    async fn handle_failure(&mut self, update: Value) -> Result<SenderFlow, SenderError> {
        {
            let store = self.store.clone();
            let payment = self
                .order
                .payments
                .iter_mut()
                .find(|p| p.is_in_progress())
                .expect("callback located an in-progress payment");
            payment.fail_current_plugin(&store).await?;
            self.notify(json!({
                "type": payload_type::PAYMENT_UPDATE,
                "update": update,
            }));
        }

        match self.submit().await {
            Ok(()) => Ok(SenderFlow::Continue),
            Err(SenderError::NoPluginsAvailable) => {
                warn!(order = ?self.order.id, "all plugins failed");
                self.notify(json!({
                    "type": payload_type::PAYMENT_UPDATE,
                    "error": NO_PLUGINS_AVAILABLE,
                    "orderId": self.order.id,
                }));
                Ok(SenderFlow::Settled)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_success(&mut self) -> Result<SenderFlow, SenderError> {
        let store = self.store.clone();
        let serialized = {
            let payment = self
                .order
                .payments
                .iter_mut()
                .find(|p| p.is_in_progress())
                .expect("callback located an in-progress payment");
            payment.complete(&store).await?;
            payment.serialize()?
        };
        self.notify(json!({
            "type": payload_type::PAYMENT_UPDATE,
            "pluginState": "success",
            "payment": serialized,
        }));

        match self.order.complete(&store).await {
            Ok(()) => {
                self.notify(json!({
                    "type": payload_type::PAYMENT_ORDER_COMPLETED,
                    "orderId": self.order.id,
                    "memo": self.order.memo,
                }));
                Ok(SenderFlow::Settled)
            }
            Err(OrderError::OutstandingPayments) => {
                info!(order = ?self.order.id, "order partially complete");
                match self.submit().await {
                    Ok(()) => {
                        self.notify(json!({
                            "type": payload_type::PAYMENT_UPDATE,
                            "orderId": self.order.id,
                            "partial": true,
                        }));
                        Ok(SenderFlow::Continue)
                    }
                    // The next payment is scheduled for later; the caller
                    // re-polls with another send.
                    Err(SenderError::NoPluginsAvailable) => {
                        self.notify(json!({
                            "type": payload_type::PAYMENT_UPDATE,
                            "orderId": self.order.id,
                            "partial": true,
                        }));
                        Ok(SenderFlow::Settled)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn plugin_entry(
        plugin_manager: &PluginManager,
        store: &Arc<Store>,
        name: &str,
    ) -> Result<RegistryEntry, SenderError> {
        match plugin_manager.get_plugin(name).await {
            Some(entry) if entry.active => Ok(entry),
            Some(_) => Err(SenderError::PluginNotActive(name.to_string())),
            None => Ok(plugin_manager.load_plugin(name, store.clone()).await?),
        }
    }

    /// Resolve the counterparty's payment target for a plugin: read the
    /// endpoint catalogue, follow the per-plugin URL, return its payload.
    async fn resolve_target(
        transport: &dyn TransportConnector,
        counterparty_url: &str,
        plugin_name: &str,
    ) -> Result<Value, SenderError> {
        let catalogue = transport
            .read_remote(counterparty_url)
            .await?
            .ok_or(SenderError::PaymentTargetNotFound)?;
        let endpoint_url = catalogue
            .get("paymentEndpoints")
            .and_then(|eps| eps.get(plugin_name))
            .and_then(Value::as_str)
            .ok_or(SenderError::PaymentTargetNotFound)?;
        transport
            .read_remote(endpoint_url)
            .await?
            .ok_or(SenderError::PaymentTargetNotFound)
    }

    fn notify(&self, payload: Value) {
        if self.notifier.send(payload).is_err() {
            warn!("user notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::order::{OrderParams, PaymentOrder};
    use crate::plugin::traits::{Plugin, PluginManifest, PluginModule, PAYMENT_PLUGIN_TYPE, RECEIVE_PAYMENT_EVENT};
    use crate::storage::database::MemoryDatabase;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{public_plugin_path, CreateOptions};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ScriptedPlugin {
        name: String,
        /// pluginState reported right after `pay`, if any.
        auto_report: Option<&'static str>,
        pays: Arc<Mutex<Vec<Value>>>,
        updates: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Plugin for ScriptedPlugin {
        fn has_rpc(&self, method: &str) -> bool {
            matches!(method, RPC_PAY | RPC_UPDATE_PAYMENT)
        }

        async fn call(
            &self,
            method: &str,
            args: Value,
            callback: NotificationSender,
        ) -> Result<(), PluginError> {
            match method {
                RPC_PAY => {
                    self.pays.lock().unwrap().push(args.clone());
                    if let Some(state) = self.auto_report {
                        let order_id = args["payload"]["orderId"].clone();
                        callback.send(json!({
                            "type": "payment_update",
                            "pluginName": self.name,
                            "orderId": order_id,
                            "pluginState": state,
                        }))?;
                    }
                }
                RPC_UPDATE_PAYMENT => {
                    self.updates.lock().unwrap().push(args);
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct ScriptedModule {
        name: String,
        auto_report: Option<&'static str>,
        pays: Arc<Mutex<Vec<Value>>>,
        updates: Arc<Mutex<Vec<Value>>>,
    }

    impl ScriptedModule {
        fn new(name: &str, auto_report: Option<&'static str>) -> Self {
            Self {
                name: name.to_string(),
                auto_report,
                pays: Arc::new(Mutex::new(Vec::new())),
                updates: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl PluginModule for ScriptedModule {
        async fn init(&self, _storage: Arc<Store>) -> Result<Arc<dyn Plugin>, PluginError> {
            Ok(Arc::new(ScriptedPlugin {
                name: self.name.clone(),
                auto_report: self.auto_report,
                pays: self.pays.clone(),
                updates: self.updates.clone(),
            }))
        }

        async fn get_manifest(&self) -> Result<PluginManifest, PluginError> {
            Ok(PluginManifest {
                name: self.name.clone(),
                kind: PAYMENT_PLUGIN_TYPE.into(),
                description: None,
                version: None,
                rpc: vec![RPC_PAY.into(), RPC_UPDATE_PAYMENT.into()],
                events: vec![RECEIVE_PAYMENT_EVENT.into()],
            })
        }
    }

    struct Rig {
        sender: PaymentSender,
        plugin_rx: mpsc::UnboundedReceiver<Value>,
        user_rx: mpsc::UnboundedReceiver<Value>,
        store: Arc<Store>,
    }

    async fn rig(plugins: Vec<ScriptedModule>) -> Rig {
        let store = Arc::new(Store::new(Arc::new(MemoryDatabase::new())));
        store.init().await.unwrap();

        let transport = Arc::new(MemoryTransport::new("peer"));
        transport.init().await.unwrap();

        let manager = Arc::new(PluginManager::new());
        let mut endpoints = serde_json::Map::new();
        for module in plugins {
            let name = module.name.clone();
            let url = transport
                .create(
                    &public_plugin_path(&name),
                    json!({"address": format!("addr-{name}")}),
                    CreateOptions::default(),
                )
                .await
                .unwrap();
            endpoints.insert(name.clone(), Value::String(url));
            manager.register_module(name, Arc::new(module)).await;
        }
        let counterparty_url = transport
            .create(
                "/public/slashpay.json",
                json!({"paymentEndpoints": endpoints}),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let mut order = PaymentOrder::new(OrderParams {
            client_order_id: "co-1".into(),
            amount: "100".into(),
            currency: None,
            denomination: None,
            counterparty_url,
            memo: Some("unit".into()),
            sending_priority: vec!["p2sh".into(), "p2tr".into()],
            frequency: None,
            created_at: None,
            first_payment_at: None,
            last_payment_at: None,
        })
        .unwrap();
        order.init(&store).await.unwrap();

        let (plugin_callback, plugin_rx) = NotificationSender::channel();
        let (notifier, user_rx) = NotificationSender::channel();
        let sender = PaymentSender::new(
            order,
            store.clone(),
            manager,
            transport,
            plugin_callback,
            notifier,
        );
        Rig {
            sender,
            plugin_rx,
            user_rx,
            store,
        }
    }

    /// Pump every queued plugin callback through the sender, as the engine's
    /// driver loop would.
    async fn drain(rig: &mut Rig) -> SenderFlow {
        let mut flow = SenderFlow::Continue;
        while let Ok(update) = rig.plugin_rx.try_recv() {
            flow = rig.sender.state_update_callback(update).await.unwrap();
        }
        flow
    }

    #[tokio::test]
    async fn first_plugin_success_completes_order() {
        let mut rig = rig(vec![
            ScriptedModule::new("p2sh", Some("success")),
            ScriptedModule::new("p2tr", Some("success")),
        ])
        .await;

        rig.sender.submit().await.unwrap();
        let flow = drain(&mut rig).await;
        assert_eq!(flow, SenderFlow::Settled);

        let payment = &rig.sender.order.payments[0];
        assert_eq!(
            payment.state.completed_by_plugin.as_ref().unwrap().name,
            "p2sh"
        );
        assert!(payment.state.tried_plugins.is_empty());

        let types: Vec<Value> = std::iter::from_fn(|| rig.user_rx.try_recv().ok())
            .map(|p| p["type"].clone())
            .collect();
        assert!(types.contains(&json!("payment_order_completed")));
    }

    #[tokio::test]
    async fn failed_plugin_falls_through_to_next() {
        let mut rig = rig(vec![
            ScriptedModule::new("p2sh", Some("failed")),
            ScriptedModule::new("p2tr", Some("success")),
        ])
        .await;

        rig.sender.submit().await.unwrap();
        let flow = drain(&mut rig).await;
        assert_eq!(flow, SenderFlow::Settled);

        let payment = &rig.sender.order.payments[0];
        assert_eq!(payment.state.tried_plugins.len(), 1);
        assert_eq!(payment.state.tried_plugins[0].name, "p2sh");
        assert_eq!(
            payment.state.completed_by_plugin.as_ref().unwrap().name,
            "p2tr"
        );
    }

    #[tokio::test]
    async fn all_plugins_failing_reports_no_plugins_available() {
        let mut rig = rig(vec![
            ScriptedModule::new("p2sh", Some("failed")),
            ScriptedModule::new("p2tr", Some("failed")),
        ])
        .await;

        rig.sender.submit().await.unwrap();
        let flow = drain(&mut rig).await;
        assert_eq!(flow, SenderFlow::Settled);

        let payment = &rig.sender.order.payments[0];
        assert!(payment.is_failed());
        assert_eq!(payment.state.tried_plugins.len(), 2);

        let reports: Vec<Value> = std::iter::from_fn(|| rig.user_rx.try_recv().ok()).collect();
        assert!(reports
            .iter()
            .any(|p| p["error"] == json!(NO_PLUGINS_AVAILABLE)));
    }

    #[tokio::test]
    async fn missing_endpoint_advances_to_next_plugin() {
        // Catalogue only lists p2tr; p2sh resolution fails and is recorded
        // as a failed attempt.
        let mut rig = rig(vec![
            ScriptedModule::new("p2tr", Some("success")),
        ])
        .await;
        // Priority still names p2sh first, but the catalogue has no entry
        // for it; register a module so plugin loading itself succeeds.
        rig.sender
            .plugin_manager
            .register_module("p2sh", Arc::new(ScriptedModule::new("p2sh", None)))
            .await;

        rig.sender.submit().await.unwrap();
        let flow = drain(&mut rig).await;
        assert_eq!(flow, SenderFlow::Settled);

        let payment = &rig.sender.order.payments[0];
        assert_eq!(payment.state.tried_plugins.len(), 1);
        assert_eq!(payment.state.tried_plugins[0].name, "p2sh");
        assert_eq!(
            payment.state.completed_by_plugin.as_ref().unwrap().name,
            "p2tr"
        );
    }

    #[tokio::test]
    async fn update_payment_forwards_to_current_plugin() {
        let module = ScriptedModule::new("p2sh", None);
        let updates = module.updates.clone();
        let mut rig = rig(vec![module, ScriptedModule::new("p2tr", None)]).await;

        rig.sender.submit().await.unwrap();
        rig.sender
            .update_payment(json!({"pin": "1234"}))
            .await
            .unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["pin"], "1234");
    }

    #[tokio::test]
    async fn update_payment_without_payment_in_flight_is_refused() {
        let mut rig = rig(vec![ScriptedModule::new("p2sh", None)]).await;

        let err = rig
            .sender
            .update_payment(json!({"pin": "1234"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::NoPaymentInProgress));
    }

    #[tokio::test]
    async fn late_callback_after_settlement_is_dropped() {
        let mut rig = rig(vec![ScriptedModule::new("p2sh", Some("success"))]).await;

        rig.sender.submit().await.unwrap();
        drain(&mut rig).await;

        // A straggler callback for the already-completed payment.
        let flow = rig
            .sender
            .state_update_callback(json!({"pluginState": "failed"}))
            .await
            .unwrap();
        assert_eq!(flow, SenderFlow::Continue);
        assert!(rig.sender.order.payments[0].state.is_final());

        let store = rig.store.clone();
        let id = rig.sender.order.payments[0].id.unwrap();
        let doc = store
            .get_outgoing_payment(&id.to_string(), Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["state"]["internalState"], json!("COMPLETED"));
    }
}
