//! Payment order.
//!
//! An order materializes into one payment (one-time) or a batch of scheduled
//! payments (recurring) and drives them one at a time: at most one payment
//! per order is ever in flight. The order completes only once every payment
//! reached a terminal state.

use crate::amount::{Amount, AmountError, Denomination};
use crate::payment::object::OutgoingPayment;
use crate::payment::PaymentError;
use crate::storage::{RemovedFilter, Store, StoreError};
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Smallest allowed recurrence interval.
pub const MIN_FREQUENCY_MS: u64 = 1;

/// Payments materialized per batch for open-ended recurring orders.
pub const BATCH_SIZE: usize = 100;

/// Order lifecycle errors.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order params are required")]
    NoOrderParams,

    #[error("counterparty URL is required")]
    CounterpartyRequired,

    #[error("invalid frequency: {0}")]
    InvalidFrequency(i64),

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("order is cancelled")]
    OrderCancelled,

    #[error("order is already completed")]
    OrderCompleted,

    #[error("order has outstanding payments")]
    OutstandingPayments,

    #[error("order can not be processed: a payment has failed")]
    CanNotProcessOrder,

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Initialized,
    Processing,
    Completed,
    Cancelled,
}

/// Caller-supplied order parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    pub client_order_id: String,
    pub amount: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub denomination: Option<Denomination>,
    #[serde(rename = "counterpartyURL")]
    pub counterparty_url: String,
    #[serde(default)]
    pub memo: Option<String>,
    pub sending_priority: Vec<String>,
    /// Milliseconds between payments; 0 or absent means one-time.
    #[serde(default)]
    pub frequency: Option<i64>,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub first_payment_at: Option<u64>,
    #[serde(default)]
    pub last_payment_at: Option<u64>,
}

/// A one-time or recurring payment order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    /// Assigned at `init`.
    pub id: Option<Uuid>,
    pub client_order_id: String,
    pub state: OrderState,
    /// Milliseconds between payments; 0 means one-time.
    pub frequency: u64,
    pub amount: Amount,
    #[serde(rename = "counterpartyURL")]
    pub counterparty_url: String,
    pub memo: String,
    pub sending_priority: Vec<String>,
    pub created_at: u64,
    pub first_payment_at: u64,
    pub last_payment_at: Option<u64>,
    /// Materialized payments; persisted as separate records, not in the
    /// order document.
    #[serde(skip, default)]
    pub payments: Vec<OutgoingPayment>,
}

impl PaymentOrder {
    /// Validate params and build a `CREATED` order.
    pub fn new(params: OrderParams) -> Result<Self, OrderError> {
        if params.counterparty_url.trim().is_empty() {
            return Err(OrderError::CounterpartyRequired);
        }

        let frequency = match params.frequency.unwrap_or(0) {
            0 => 0,
            f if f < 0 => return Err(OrderError::InvalidFrequency(f)),
            f => f as u64,
        };
        debug_assert!(frequency == 0 || frequency >= MIN_FREQUENCY_MS);

        let created_at = params.created_at.unwrap_or_else(now_ms);
        let first_payment_at = params.first_payment_at.unwrap_or(created_at);
        if let Some(last) = params.last_payment_at {
            if last <= first_payment_at {
                return Err(OrderError::InvalidTimestamp);
            }
        }

        let amount = Amount::new(params.amount, params.currency, params.denomination)?;

        Ok(Self {
            id: None,
            client_order_id: params.client_order_id,
            state: OrderState::Created,
            frequency,
            amount,
            counterparty_url: params.counterparty_url,
            memo: params.memo.unwrap_or_default(),
            sending_priority: params.sending_priority,
            created_at,
            first_payment_at,
            last_payment_at: params.last_payment_at,
            payments: Vec::new(),
        })
    }

    /// Assign an id, materialize the payment schedule, and persist the order
    /// plus every payment.
    pub async fn init(&mut self, store: &Store) -> Result<(), OrderError> {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        self.state = OrderState::Initialized;

        let count = if self.frequency == 0 {
            1
        } else {
            match self.last_payment_at {
                Some(last) => ((last - self.first_payment_at) / self.frequency) as usize,
                None => BATCH_SIZE,
            }
        };
        for i in 0..count {
            self.payments.push(self.payment_at(i));
        }

        store.save_order(&self.to_doc()?).await?;
        for payment in &mut self.payments {
            payment.init(store).await?;
        }

        info!(order = ?self.id, payments = self.payments.len(), "order initialized");
        Ok(())
    }

    /// Return the next actionable payment, or `None` once the order has run
    /// to completion.
    ///
    /// A failed payment stops the order (`CanNotProcessOrder`); an in-flight
    /// payment is returned idempotently; a payment whose `execute_at` is
    /// still in the future is returned unchanged for the caller to re-poll.
    pub async fn process(&mut self, store: &Store) -> Result<Option<&mut OutgoingPayment>, OrderError> {
        if self.payments.iter().any(OutgoingPayment::is_failed) {
            return Err(OrderError::CanNotProcessOrder);
        }

        if let Some(pos) = self.payments.iter().position(OutgoingPayment::is_in_progress) {
            let payment = &mut self.payments[pos];
            payment.process(store).await?;
            return Ok(Some(&mut self.payments[pos]));
        }

        let pos = match self.payments.iter().position(|p| !p.is_final()) {
            Some(pos) => pos,
            None => match self.extend_schedule(store).await? {
                Some(pos) => pos,
                None => {
                    self.complete(store).await?;
                    return Ok(None);
                }
            },
        };

        if !self.payments[pos].is_due() {
            debug!(order = ?self.id, "next payment not yet due");
            return Ok(Some(&mut self.payments[pos]));
        }

        if self.payments[pos].id.is_none() {
            self.payments[pos].init(store).await?;
        }
        if self.state != OrderState::Processing {
            self.state = OrderState::Processing;
            self.update(store).await?;
        }
        self.payments[pos].process(store).await?;
        Ok(Some(&mut self.payments[pos]))
    }

    /// For a recurring order with schedule left, materialize the next batch
    /// and return the index of its first payment.
    async fn extend_schedule(&mut self, store: &Store) -> Result<Option<usize>, OrderError> {
        if self.frequency == 0 {
            return Ok(None);
        }

        let start = self.payments.len();
        let count = match self.last_payment_at {
            Some(last) => (start..)
                .take(BATCH_SIZE)
                .take_while(|i| self.first_payment_at + (*i as u64) * self.frequency < last)
                .count(),
            None => BATCH_SIZE,
        };
        if count == 0 {
            return Ok(None);
        }

        for i in start..start + count {
            let mut payment = self.payment_at(i);
            payment.init(store).await?;
            self.payments.push(payment);
        }
        self.update(store).await?;
        info!(order = ?self.id, count, "allocated recurring batch");
        Ok(Some(start))
    }

    fn payment_at(&self, index: usize) -> OutgoingPayment {
        OutgoingPayment::new(
            self.id.unwrap_or_default(),
            self.client_order_id.clone(),
            self.counterparty_url.clone(),
            self.memo.clone(),
            self.sending_priority.clone(),
            self.amount.clone(),
            self.first_payment_at + (index as u64) * self.frequency,
        )
    }

    /// Mark the order completed; requires every payment terminal.
    pub async fn complete(&mut self, store: &Store) -> Result<(), OrderError> {
        match self.state {
            OrderState::Cancelled => return Err(OrderError::OrderCancelled),
            OrderState::Completed => return Err(OrderError::OrderCompleted),
            _ => {}
        }
        if self.payments.iter().any(|p| !p.is_final()) {
            return Err(OrderError::OutstandingPayments);
        }

        self.state = OrderState::Completed;
        self.update(store).await?;
        info!(order = ?self.id, "order completed");
        Ok(())
    }

    /// Cancel the order and every non-final payment.
    pub async fn cancel(&mut self, store: &Store) -> Result<(), OrderError> {
        match self.state {
            OrderState::Completed => return Err(OrderError::OrderCompleted),
            OrderState::Cancelled => return Err(OrderError::OrderCancelled),
            _ => {}
        }

        for payment in &mut self.payments {
            if !payment.is_final() {
                payment.cancel(store).await?;
            }
        }
        self.state = OrderState::Cancelled;
        self.update(store).await?;
        info!(order = ?self.id, "order cancelled");
        Ok(())
    }

    /// Load an order and its live payments from the store.
    pub async fn find(id: &Uuid, store: &Store) -> Result<Self, OrderError> {
        let doc = store
            .get_order(&id.to_string(), RemovedFilter::default())
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(id.to_string()))?;
        let mut order: PaymentOrder = serde_json::from_value(doc)?;

        let mut filter = Map::new();
        filter.insert("orderId".into(), Value::String(id.to_string()));
        let docs = store
            .get_outgoing_payments(&filter, RemovedFilter::default())
            .await?;

        let mut payments = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<OutgoingPayment>, _>>()?;
        // Store scans come back in key order; restore schedule order.
        payments.sort_by_key(|p| (p.execute_at, p.created_at));
        order.payments = payments;
        Ok(order)
    }

    async fn update(&self, store: &Store) -> Result<(), OrderError> {
        let id = self.id.ok_or(PaymentError::NotInitialized)?;
        store.update_order(&id.to_string(), self.to_doc()?).await?;
        Ok(())
    }

    /// Document form persisted to the store (payments live in their own
    /// records).
    fn to_doc(&self) -> Result<Value, OrderError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Full serialized form: the order document plus its payments.
    pub fn serialize(&self) -> Result<Value, OrderError> {
        let mut doc = self.to_doc()?;
        let payments = self
            .payments
            .iter()
            .map(OutgoingPayment::serialize)
            .collect::<Result<Vec<_>, _>>()?;
        doc.as_object_mut()
            .expect("order document is an object")
            .insert("payments".into(), Value::Array(payments));
        Ok(doc)
    }
}
