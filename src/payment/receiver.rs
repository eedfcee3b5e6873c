//! Payment receiver.
//!
//! The receiver publishes this peer's endpoint catalogue into the transport
//! (public, and per-invoice private), subscribes plugins to receive events,
//! and reconciles plugin-delivered receipts into incoming payment records.
//! Personal payments (those tied to an invoice) are checked against the
//! expected amount; shortfalls produce a fresh invoice for the remainder.

use crate::amount::{Amount, AmountError, Denomination, DEFAULT_CURRENCY};
use crate::payment::incoming::{IncomingPayment, PluginReceipt};
use crate::payment::PaymentError;
use crate::plugin::{NotificationSender, PluginError, PluginManager, RECEIVE_PAYMENT_EVENT};
use crate::storage::{Store, StoreError};
use crate::transport::{
    invoice_index_path, invoice_plugin_path, public_index_path, public_plugin_path, CreateOptions,
    TransportConnector, TransportError,
};
use crate::utils::now_ms;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Receive-path errors.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("payment object not found")]
    PaymentObjectNotFound,

    #[error("payment currency mismatch: expected {expected}, got {got}")]
    PaymentCurrencyMismatch { expected: String, got: String },

    #[error("payment denomination mismatch: expected {expected}, got {got}")]
    PaymentDenominationMismatch { expected: String, got: String },

    #[error("payload is missing the plugin name")]
    MissingPluginName,

    #[error("payload is missing a usable amount")]
    MissingAmount,

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receiver-side coordinator.
pub struct PaymentReceiver {
    store: Arc<Store>,
    plugin_manager: Arc<PluginManager>,
    transport: Arc<dyn TransportConnector>,
    /// Handed to plugins with every receive event.
    plugin_callback: NotificationSender,
    /// Engine-supplied notification sink for reconciled payments.
    notifier: NotificationSender,
}

impl PaymentReceiver {
    pub fn new(
        store: Arc<Store>,
        plugin_manager: Arc<PluginManager>,
        transport: Arc<dyn TransportConnector>,
        plugin_callback: NotificationSender,
        notifier: NotificationSender,
    ) -> Self {
        Self {
            store,
            plugin_manager,
            transport,
            plugin_callback,
            notifier,
        }
    }

    /// Publish the public endpoint catalogue and subscribe plugins to
    /// receive events. Returns the catalogue URL.
    pub async fn init(&self) -> Result<String, ReceiverError> {
        let mut endpoints = Map::new();
        for entry in self.payment_plugins().await {
            let name = entry.manifest.name;
            let url = self.transport.get_url(&public_plugin_path(&name)).await?;
            endpoints.insert(name, Value::String(url));
        }

        let url = self
            .transport
            .create(
                &public_index_path(),
                json!({ "paymentEndpoints": endpoints }),
                CreateOptions::synced(),
            )
            .await?;
        info!(%url, "published public payment catalogue");

        self.plugin_manager
            .dispatch_event(
                RECEIVE_PAYMENT_EVENT,
                json!({ "id": Value::Null }),
                self.plugin_callback.clone(),
            )
            .await;

        Ok(url)
    }

    /// Create (or refresh) a private invoice for `client_order_id` over
    /// `expected`: encrypted per-plugin endpoints, an encrypted index, an
    /// incoming payment record, and a receive-event dispatch enriched with
    /// the expectation. Returns the invoice index URL.
    pub async fn create_invoice(
        &self,
        client_order_id: &str,
        expected: &Amount,
    ) -> Result<String, ReceiverError> {
        let mut endpoints = Map::new();
        let mut plugin_names = Vec::new();
        for entry in self.payment_plugins().await {
            let name = entry.manifest.name;
            let url = self
                .transport
                .get_url(&invoice_plugin_path(client_order_id, &name))
                .await?;
            endpoints.insert(name.clone(), Value::String(url));
            plugin_names.push(name);
        }

        let url = self
            .transport
            .create(
                &invoice_index_path(client_order_id),
                json!({ "paymentEndpoints": endpoints }),
                CreateOptions::encrypted(),
            )
            .await?;

        // A continuation invoice (shortfall) reuses the existing record; a
        // fresh invoice creates one with the expectation attached.
        let payment_id = match IncomingPayment::find_by_client_order_id(client_order_id, &self.store)
            .await?
        {
            Some(mut payment) => {
                payment.invoice_url = Some(url.clone());
                payment.update(&self.store).await?;
                payment.id
            }
            None => {
                let mut payment =
                    IncomingPayment::new_invoice(client_order_id.to_string(), expected, String::new());
                payment.invoice_url = Some(url.clone());
                payment.save(&self.store).await?;
                payment.id
            }
        };

        info!(%url, client_order_id, "invoice created");

        self.plugin_manager
            .dispatch_event(
                RECEIVE_PAYMENT_EVENT,
                json!({
                    "id": payment_id,
                    "clientOrderId": client_order_id,
                    "expectedAmount": expected.amount,
                    "expectedCurrency": expected.currency,
                    "expectedDenomination": expected.denomination,
                }),
                self.plugin_callback.clone(),
            )
            .await;

        Ok(url)
    }

    /// Reconcile a plugin-delivered `payment_new` payload into an incoming
    /// payment record, optionally refreshing the public catalogue afterwards.
    ///
    /// Returns the serialized record; the engine-supplied notification sink
    /// receives it as well.
    pub async fn handle_new_payment(
        &self,
        payload: Value,
        regenerate: bool,
    ) -> Result<Value, ReceiverError> {
        let receipt = receipt_from_payload(&payload)?;
        let is_personal = payload
            .get("isPersonalPayment")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let payment = if is_personal {
            self.reconcile_personal(&payload, receipt).await?
        } else {
            let memo = payload
                .get("memo")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let payment = IncomingPayment::new_completed(receipt, memo);
            payment.save(&self.store).await?;
            info!(payment = %payment.id, "recorded unsolicited incoming payment");
            payment
        };

        if regenerate {
            self.init().await?;
        }

        let serialized = payment.serialize()?;
        if self.notifier.send(serialized.clone()).is_err() {
            warn!("notification receiver dropped");
        }
        Ok(serialized)
    }

    /// Apply a personal (invoice-bound) receipt: verify the expectation,
    /// append, and either complete the record or produce a continuation
    /// invoice for the remainder.
    async fn reconcile_personal(
        &self,
        payload: &Value,
        receipt: PluginReceipt,
    ) -> Result<IncomingPayment, ReceiverError> {
        let mut payment = self.find_personal(payload).await?;

        // Expectation checks precede any mutation.
        if let Some(expected) = &payment.expected_currency {
            if *expected != receipt.amount.currency {
                return Err(ReceiverError::PaymentCurrencyMismatch {
                    expected: expected.clone(),
                    got: receipt.amount.currency.clone(),
                });
            }
        }
        if let Some(expected) = payment.expected_denomination {
            if expected != receipt.amount.denomination {
                return Err(ReceiverError::PaymentDenominationMismatch {
                    expected: expected.to_string(),
                    got: receipt.amount.denomination.to_string(),
                });
            }
        }

        payment.register_receipt(receipt)?;
        payment.update(&self.store).await?;

        let missing = payment.missing_amount()?;
        if missing > 0 {
            let client_order_id = payment
                .client_order_id
                .clone()
                .unwrap_or_else(|| payment.id.to_string());
            let remainder = Amount::new(
                missing.to_string(),
                payment.expected_currency.clone(),
                payment.expected_denomination,
            )?;
            let url = self.create_invoice(&client_order_id, &remainder).await?;
            payment.invoice_url = Some(url);
            info!(payment = %payment.id, missing, "invoice continued for remainder");
        } else {
            info!(payment = %payment.id, "incoming payment completed");
        }

        Ok(payment)
    }

    async fn find_personal(&self, payload: &Value) -> Result<IncomingPayment, ReceiverError> {
        if let Some(id) = payload
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return IncomingPayment::find(&id, &self.store, Default::default())
                .await?
                .ok_or(ReceiverError::PaymentObjectNotFound);
        }
        if let Some(client_order_id) = payload.get("clientOrderId").and_then(Value::as_str) {
            return IncomingPayment::find_by_client_order_id(client_order_id, &self.store)
                .await?
                .ok_or(ReceiverError::PaymentObjectNotFound);
        }
        Err(ReceiverError::PaymentObjectNotFound)
    }

    async fn payment_plugins(&self) -> Vec<crate::plugin::RegistryEntry> {
        self.plugin_manager
            .get_plugins(Some(true))
            .await
            .into_iter()
            .filter(|e| e.manifest.is_payment_type())
            .collect()
    }
}

/// Build a receipt from a `payment_new` payload, with `BTC`/`BASE` defaults.
fn receipt_from_payload(payload: &Value) -> Result<PluginReceipt, ReceiverError> {
    let name = payload
        .get("pluginName")
        .and_then(Value::as_str)
        .ok_or(ReceiverError::MissingPluginName)?
        .to_string();
    let amount = payload
        .get("amount")
        .and_then(Value::as_str)
        .ok_or(ReceiverError::MissingAmount)?;
    let currency = payload
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CURRENCY)
        .to_string();
    let denomination: Denomination = match payload.get("denomination") {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
        _ => Denomination::default(),
    };

    Ok(PluginReceipt {
        name,
        state: payload
            .get("pluginState")
            .and_then(Value::as_str)
            .unwrap_or("success")
            .to_string(),
        amount: Amount::new(amount, Some(currency), Some(denomination))?,
        raw_data: payload
            .get("rawData")
            .cloned()
            .unwrap_or_else(|| payload.clone()),
        received_at: now_ms(),
    })
}
