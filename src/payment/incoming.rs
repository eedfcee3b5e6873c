//! Incoming payment record.
//!
//! Incoming payments are created by the receiver: either as invoices waiting
//! to be reconciled against an expected amount (personal payments), or as
//! already-complete records for unsolicited receipts. Every plugin delivery
//! is appended to `received_by_plugins`; the record completes once the
//! received total covers the expectation.

use crate::amount::{Amount, AmountError, Denomination, DEFAULT_CURRENCY};
use crate::payment::{Direction, PaymentError};
use crate::storage::{RemovedFilter, Store};
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Incoming payments only distinguish "still collecting" from "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingState {
    InProgress,
    Completed,
}

/// One plugin delivery against an incoming payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginReceipt {
    /// Delivering plugin name.
    pub name: String,
    /// Plugin-reported state, carried verbatim.
    pub state: String,
    pub amount: Amount,
    /// Opaque payload as delivered by the plugin.
    pub raw_data: Value,
    pub received_at: u64,
}

/// An incoming payment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayment {
    pub id: Uuid,
    pub client_order_id: Option<String>,
    pub memo: String,
    /// Reconciled amount; `None` until at least one receipt lands.
    pub amount: Option<Amount>,
    pub expected_amount: Option<String>,
    pub expected_currency: Option<String>,
    pub expected_denomination: Option<Denomination>,
    pub direction: Direction,
    pub internal_state: IncomingState,
    pub received_by_plugins: Vec<PluginReceipt>,
    /// URL of the currently outstanding invoice, when one exists.
    pub invoice_url: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub removed: bool,
}

impl IncomingPayment {
    /// A fresh invoice record: expectation set, nothing received yet.
    pub fn new_invoice(client_order_id: String, expected: &Amount, memo: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_order_id: Some(client_order_id),
            memo,
            amount: None,
            expected_amount: Some(expected.amount.clone()),
            expected_currency: Some(expected.currency.clone()),
            expected_denomination: Some(expected.denomination),
            direction: Direction::Incoming,
            internal_state: IncomingState::InProgress,
            received_by_plugins: Vec::new(),
            invoice_url: None,
            created_at: now_ms(),
            removed: false,
        }
    }

    /// A record for an unsolicited (non-personal) receipt, complete on
    /// arrival.
    pub fn new_completed(receipt: PluginReceipt, memo: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_order_id: None,
            memo,
            amount: Some(receipt.amount.clone()),
            expected_amount: None,
            expected_currency: None,
            expected_denomination: None,
            direction: Direction::Incoming,
            internal_state: IncomingState::Completed,
            received_by_plugins: vec![receipt],
            invoice_url: None,
            created_at: now_ms(),
            removed: false,
        }
    }

    /// Load a record by id.
    pub async fn find(
        id: &Uuid,
        store: &Store,
        removed: RemovedFilter,
    ) -> Result<Option<Self>, PaymentError> {
        let doc = store
            .get_incoming_payment(&id.to_string(), removed)
            .await?;
        Ok(doc.map(serde_json::from_value).transpose()?)
    }

    /// Load the live invoice for a client order id, if one exists.
    pub async fn find_by_client_order_id(
        client_order_id: &str,
        store: &Store,
    ) -> Result<Option<Self>, PaymentError> {
        let mut filter = Map::new();
        filter.insert("clientOrderId".into(), Value::String(client_order_id.into()));
        let mut docs = store
            .get_incoming_payments(&filter, RemovedFilter::default())
            .await?;
        Ok(docs.pop().map(serde_json::from_value).transpose()?)
    }

    pub async fn save(&self, store: &Store) -> Result<(), PaymentError> {
        store.save_incoming_payment(&self.serialize()?).await?;
        Ok(())
    }

    /// Persist the full current form of the record.
    pub async fn update(&self, store: &Store) -> Result<(), PaymentError> {
        store
            .update_incoming_payment(&self.id.to_string(), self.serialize()?)
            .await?;
        Ok(())
    }

    /// Sum of all delivered receipts, in base units.
    pub fn received_total(&self) -> Result<u64, AmountError> {
        let mut total = 0u64;
        for receipt in &self.received_by_plugins {
            total = total.saturating_add(receipt.amount.base_units()?);
        }
        Ok(total)
    }

    /// Base units still missing against the expectation; zero when covered
    /// or when no expectation is set.
    pub fn missing_amount(&self) -> Result<u64, AmountError> {
        let Some(expected) = &self.expected_amount else {
            return Ok(0);
        };
        let expected = expected
            .parse::<u64>()
            .map_err(|_| AmountError::InvalidAmount(expected.clone()))?;
        Ok(expected.saturating_sub(self.received_total()?))
    }

    /// Append a receipt and recompute state: completed once the running
    /// total covers the expectation, in-progress otherwise.
    pub fn register_receipt(&mut self, receipt: PluginReceipt) -> Result<(), AmountError> {
        self.received_by_plugins.push(receipt);

        let total = self.received_total()?;
        self.amount = Some(Amount::new(
            total.to_string(),
            Some(
                self.expected_currency
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            ),
            self.expected_denomination,
        )?);

        if self.missing_amount()? == 0 {
            self.internal_state = IncomingState::Completed;
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.internal_state == IncomingState::Completed
    }

    pub fn serialize(&self) -> Result<Value, PaymentError> {
        Ok(serde_json::to_value(self)?)
    }
}
