//! Payment manager facade.
//!
//! The top-level surface of the engine: order creation, sending, invoicing,
//! receiving, and the two entry points (plugin-originated payloads and
//! user-originated updates). Plugin callbacks funnel through one channel
//! into [`PaymentManager::entry_point_for_plugin`], which routes
//! `payment_update` payloads to the per-order driver task; user updates for
//! an order being sent travel through the same driver, so all work on an
//! order happens on a single writer.

use crate::amount::{Amount, AmountError, Denomination};
use crate::config::Config;
use crate::payment::order::{OrderError, OrderParams, PaymentOrder};
use crate::payment::receiver::{PaymentReceiver, ReceiverError};
use crate::payment::sender::{PaymentSender, SenderError, SenderFlow};
use crate::payment::PaymentError;
use crate::plugin::traits::payload_type;
use crate::plugin::{
    NotificationSender, PluginError, PluginManager, RPC_UPDATE_PAYMENT,
};
use crate::storage::{RemovedFilter, Store, StoreError};
use crate::transport::{
    invoice_plugin_path, public_plugin_path, CreateOptions, TransportConnector, TransportError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Facade-level errors.
#[derive(Debug, Error)]
pub enum SlashpayError {
    #[error("engine is not ready; call init() first")]
    NotReady,

    #[error("plugin name is missing from payload")]
    PluginNameMissing,

    #[error("client order id is missing from payload")]
    ClientOrderIdMissing,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("a sender is already active for order {0}")]
    SenderAlreadyActive(Uuid),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Sender(#[from] SenderError),

    #[error(transparent)]
    Receiver(#[from] ReceiverError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Extra invoice parameters.
#[derive(Debug, Clone, Default)]
pub struct InvoiceOptions {
    pub currency: Option<String>,
    pub denomination: Option<Denomination>,
}

/// Work items consumed by an order's single-writer driver task.
enum DriverMessage {
    /// Progress callback from a plugin for the in-flight payment.
    PluginUpdate(Value),
    /// User-originated update forwarded through the sender.
    UserUpdate(Value),
}

impl DriverMessage {
    fn into_value(self) -> Value {
        match self {
            DriverMessage::PluginUpdate(value) | DriverMessage::UserUpdate(value) => value,
        }
    }
}

struct ActiveSender {
    /// Routes payloads into the order's driver task.
    update_tx: mpsc::UnboundedSender<DriverMessage>,
    handle: Option<JoinHandle<()>>,
}

/// Top-level engine facade.
pub struct PaymentManager {
    store: Arc<Store>,
    plugin_manager: Arc<PluginManager>,
    transport: Arc<dyn TransportConnector>,
    config: Config,
    /// Sink handed to plugins; drained into `entry_point_for_plugin`.
    plugin_sink: NotificationSender,
    plugin_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    /// User notification sink.
    notifier: NotificationSender,
    receiver: RwLock<Option<Arc<PaymentReceiver>>>,
    active_senders: Arc<Mutex<HashMap<Uuid, ActiveSender>>>,
    ready: AtomicBool,
}

impl PaymentManager {
    /// Build an engine over a transport and a user notification channel.
    /// The store is created from the configuration; call
    /// [`init`](Self::init) before use.
    pub fn new(
        config: Config,
        transport: Arc<dyn TransportConnector>,
        user_tx: mpsc::UnboundedSender<Value>,
    ) -> Result<Arc<Self>, SlashpayError> {
        let store = Store::open(&config.storage.data_dir, config.storage.backend())
            .map_err(StoreError::Backend)?;
        Ok(Self::with_store(config, Arc::new(store), transport, user_tx))
    }

    /// Build an engine over an existing store.
    pub fn with_store(
        config: Config,
        store: Arc<Store>,
        transport: Arc<dyn TransportConnector>,
        user_tx: mpsc::UnboundedSender<Value>,
    ) -> Arc<Self> {
        let (plugin_sink, plugin_rx) = NotificationSender::channel();
        Arc::new(Self {
            store,
            plugin_manager: Arc::new(PluginManager::new()),
            transport,
            config,
            plugin_sink,
            plugin_rx: Mutex::new(Some(plugin_rx)),
            drain_handle: Mutex::new(None),
            notifier: NotificationSender::new(user_tx),
            receiver: RwLock::new(None),
            active_senders: Arc::new(Mutex::new(HashMap::new())),
            ready: AtomicBool::new(false),
        })
    }

    /// Initialize store and transport and start draining plugin callbacks.
    pub async fn init(self: &Arc<Self>) -> Result<(), SlashpayError> {
        self.store.init().await?;
        self.transport.init().await?;

        if let Some(mut rx) = self.plugin_rx.lock().await.take() {
            let weak = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    let Some(manager) = weak.upgrade() else { break };
                    if let Err(e) = manager.entry_point_for_plugin(payload).await {
                        warn!("plugin entry point error: {e}");
                    }
                }
            });
            *self.drain_handle.lock().await = Some(handle);
        }

        self.ready.store(true, Ordering::SeqCst);
        info!("payment manager initialized");
        Ok(())
    }

    /// The plugin manager, for registering plugin modules.
    pub fn plugin_manager(&self) -> &Arc<PluginManager> {
        &self.plugin_manager
    }

    /// The engine store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn ensure_ready(&self) -> Result<(), SlashpayError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SlashpayError::NotReady)
        }
    }

    /// Create and initialize a payment order; returns its serialized form.
    pub async fn create_payment_order(
        &self,
        params: Option<OrderParams>,
    ) -> Result<Value, SlashpayError> {
        self.ensure_ready()?;
        let params = params.ok_or(OrderError::NoOrderParams)?;
        let mut order = PaymentOrder::new(params)?;
        order.init(&self.store).await?;
        Ok(order.serialize()?)
    }

    /// Start sending an order: submit the first payment and spawn the
    /// driver task that reacts to plugin callbacks.
    ///
    /// At most one sender may drive an order at a time; a second call while
    /// a driver is still running is refused.
    pub async fn send_payment(self: &Arc<Self>, order_id: Uuid) -> Result<(), SlashpayError> {
        self.ensure_ready()?;
        let order = PaymentOrder::find(&order_id, &self.store).await?;

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<DriverMessage>();
        {
            let mut senders = self.active_senders.lock().await;
            if senders.contains_key(&order_id) {
                return Err(SlashpayError::SenderAlreadyActive(order_id));
            }
            senders.insert(
                order_id,
                ActiveSender {
                    update_tx,
                    handle: None,
                },
            );
        }

        let mut sender = PaymentSender::new(
            order,
            self.store.clone(),
            self.plugin_manager.clone(),
            self.transport.clone(),
            self.plugin_sink.clone(),
            self.notifier.clone(),
        );

        if let Err(e) = sender.submit().await {
            self.active_senders.lock().await.remove(&order_id);
            return Err(e.into());
        }

        // Single-writer driver: every callback and user update for this
        // order is handled here, in arrival order.
        let senders = self.active_senders.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = update_rx.recv().await {
                match message {
                    DriverMessage::PluginUpdate(update) => {
                        match sender.state_update_callback(update).await {
                            Ok(SenderFlow::Continue) => {}
                            Ok(SenderFlow::Settled) => break,
                            Err(e) => {
                                error!(order = %order_id, "sender driver error: {e}");
                                break;
                            }
                        }
                    }
                    DriverMessage::UserUpdate(data) => {
                        if let Err(e) = sender.update_payment(data).await {
                            warn!(order = %order_id, "user update rejected: {e}");
                        }
                    }
                }
            }
            senders.lock().await.remove(&order_id);
        });

        if let Some(entry) = self.active_senders.lock().await.get_mut(&order_id) {
            entry.handle = Some(handle);
        }
        Ok(())
    }

    /// Wait for an order's driver task to settle. Returns immediately when
    /// no driver is active for the order.
    pub async fn wait_for_order(&self, order_id: Uuid) -> Result<(), SlashpayError> {
        let handle = {
            let mut senders = self.active_senders.lock().await;
            senders
                .get_mut(&order_id)
                .and_then(|entry| entry.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Load every configured plugin and publish the public receive
    /// catalogue. Returns the catalogue URL.
    pub async fn receive_payments(&self) -> Result<String, SlashpayError> {
        self.ensure_ready()?;
        self.load_configured_plugins().await?;
        let receiver = self.receiver().await;
        Ok(receiver.init().await?)
    }

    /// Create a private invoice for `client_order_id` over `amount`.
    pub async fn create_invoice(
        &self,
        client_order_id: &str,
        amount: &str,
        opts: Option<InvoiceOptions>,
    ) -> Result<String, SlashpayError> {
        self.ensure_ready()?;
        self.load_configured_plugins().await?;
        let opts = opts.unwrap_or_default();
        let expected = Amount::new(amount, opts.currency, opts.denomination)?;
        let receiver = self.receiver().await;
        Ok(receiver.create_invoice(client_order_id, &expected).await?)
    }

    /// Entry point for plugin-originated payloads, dispatched by `type`.
    pub async fn entry_point_for_plugin(&self, payload: Value) -> Result<(), SlashpayError> {
        match payload.get("type").and_then(Value::as_str) {
            Some(payload_type::PAYMENT_NEW) => {
                let receiver = self.receiver().await;
                receiver.handle_new_payment(payload, true).await?;
                Ok(())
            }
            Some(payload_type::PAYMENT_UPDATE) => self.handle_payment_update(payload).await,
            Some(payload_type::PAYMENT_ORDER_COMPLETED) => {
                self.notify_user(payload);
                Ok(())
            }
            Some(payload_type::READY_TO_RECEIVE) => {
                self.create_payment_file(&payload).await?;
                Ok(())
            }
            _ => {
                self.notify_user(payload);
                Ok(())
            }
        }
    }

    /// Route a plugin progress update to its order's driver, falling back
    /// to user notification when no sender is active for the order.
    async fn handle_payment_update(&self, payload: Value) -> Result<(), SlashpayError> {
        let order_id = payload
            .get("orderId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        let mut payload = payload;
        if let Some(order_id) = order_id {
            let senders = self.active_senders.lock().await;
            if let Some(entry) = senders.get(&order_id) {
                payload = match entry.update_tx.send(DriverMessage::PluginUpdate(payload)) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(message)) => message.into_value(),
                };
                debug!(order = %order_id, "driver gone, forwarding update to user");
            }
        }
        self.notify_user(payload);
        Ok(())
    }

    /// Entry point for user-originated updates: `{pluginName, paymentId?}`
    /// plus plugin-specific fields.
    ///
    /// When the referenced payment's order has an active sender, the update
    /// is handed to that sender's driver, which validates that a payment is
    /// actually in flight before forwarding to its current plugin.
    /// Otherwise the named plugin is loaded and its `updatePayment` called
    /// directly.
    pub async fn entry_point_for_user(&self, data: Value) -> Result<(), SlashpayError> {
        self.ensure_ready()?;
        let plugin_name = data
            .get("pluginName")
            .and_then(Value::as_str)
            .ok_or(SlashpayError::PluginNameMissing)?
            .to_string();

        let mut data = data;
        if let Some(order_id) = self.order_of_payment(&data).await? {
            let senders = self.active_senders.lock().await;
            if let Some(entry) = senders.get(&order_id) {
                data = match entry.update_tx.send(DriverMessage::UserUpdate(data)) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(message)) => message.into_value(),
                };
                debug!(order = %order_id, "driver gone, forwarding update to plugin");
            }
        }

        let entry = match self.plugin_manager.get_plugin(&plugin_name).await {
            Some(entry) if entry.active => entry,
            Some(_) => return Err(PluginError::NotActive(plugin_name).into()),
            None => {
                self.plugin_manager
                    .load_plugin(&plugin_name, self.store.clone())
                    .await?
            }
        };
        entry
            .plugin
            .call(RPC_UPDATE_PAYMENT, data, self.plugin_sink.clone())
            .await?;
        Ok(())
    }

    /// Resolve the order a user update refers to via its `paymentId`.
    async fn order_of_payment(&self, data: &Value) -> Result<Option<Uuid>, SlashpayError> {
        let Some(payment_id) = data.get("paymentId").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(doc) = self
            .store
            .get_outgoing_payment(payment_id, RemovedFilter::default())
            .await?
        else {
            return Ok(None);
        };
        Ok(doc
            .get("orderId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok()))
    }

    /// Write a plugin-provisioned payment file to the transport.
    ///
    /// Files for amount-specific (invoice) provisioning are private and
    /// encrypted and require a `clientOrderId`; everything else lands at
    /// the plugin's public path.
    pub async fn create_payment_file(&self, payload: &Value) -> Result<String, SlashpayError> {
        let plugin_name = payload
            .get("pluginName")
            .and_then(Value::as_str)
            .ok_or(SlashpayError::PluginNameMissing)?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let is_private = payload
            .get("amountWasSpecified")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let url = if is_private {
            let client_order_id = payload
                .get("clientOrderId")
                .and_then(Value::as_str)
                .ok_or(SlashpayError::ClientOrderIdMissing)?;
            self.transport
                .create(
                    &invoice_plugin_path(client_order_id, plugin_name),
                    data,
                    CreateOptions::encrypted(),
                )
                .await?
        } else {
            self.transport
                .create(
                    &public_plugin_path(plugin_name),
                    data,
                    CreateOptions::synced(),
                )
                .await?
        };
        debug!(%url, plugin = %plugin_name, "payment file written");
        Ok(url)
    }

    /// Stop all plugins and close the transport.
    pub async fn shutdown(&self) -> Result<(), SlashpayError> {
        info!("shutting down payment manager");
        self.plugin_manager.shutdown().await;
        if let Some(handle) = self.drain_handle.lock().await.take() {
            handle.abort();
        }
        self.transport.close().await?;
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn receiver(&self) -> Arc<PaymentReceiver> {
        {
            let receiver = self.receiver.read().await;
            if let Some(receiver) = receiver.as_ref() {
                return receiver.clone();
            }
        }
        let mut slot = self.receiver.write().await;
        slot.get_or_insert_with(|| {
            Arc::new(PaymentReceiver::new(
                self.store.clone(),
                self.plugin_manager.clone(),
                self.transport.clone(),
                self.plugin_sink.clone(),
                self.notifier.clone(),
            ))
        })
        .clone()
    }

    async fn load_configured_plugins(&self) -> Result<(), SlashpayError> {
        for entry_point in &self.config.plugins {
            if let Err(e) = self
                .plugin_manager
                .load_plugin(entry_point, self.store.clone())
                .await
            {
                match e {
                    // Already loaded earlier in this session.
                    PluginError::Conflict(_) => {
                        debug!(plugin = %entry_point, "already loaded");
                    }
                    other => return Err(other.into()),
                }
            }
        }
        Ok(())
    }

    fn notify_user(&self, payload: Value) {
        if self.notifier.send(payload).is_err() {
            warn!("user notification receiver dropped");
        }
    }
}
