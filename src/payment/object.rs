//! Outgoing payment record.
//!
//! One [`OutgoingPayment`] is a single attempt to move an amount to a
//! counterparty, driven through its embedded [`PaymentState`] and persisted
//! after every transition. Records are soft-deleted only.

use crate::amount::Amount;
use crate::payment::state::{PaymentState, PluginRun};
use crate::payment::{Direction, PaymentError};
use crate::storage::{RemovedFilter, Store};
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// A single outgoing payment, owned by a payment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPayment {
    /// Assigned at `init`; `None` for a not-yet-persisted payment.
    pub id: Option<Uuid>,
    pub order_id: Uuid,
    pub client_order_id: String,
    #[serde(rename = "counterpartyURL")]
    pub counterparty_url: String,
    pub memo: String,
    pub sending_priority: Vec<String>,
    pub amount: Amount,
    pub direction: Direction,
    /// Epoch ms of record creation.
    pub created_at: u64,
    /// Epoch ms before which the payment must not be processed.
    pub execute_at: u64,
    pub state: PaymentState,
    /// Last raw plugin update applied to this payment, if any.
    #[serde(default)]
    pub plugin_update: Option<Value>,
    #[serde(default)]
    pub removed: bool,
}

impl OutgoingPayment {
    /// Build a fresh, not-yet-persisted payment for an order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: Uuid,
        client_order_id: String,
        counterparty_url: String,
        memo: String,
        sending_priority: Vec<String>,
        amount: Amount,
        execute_at: u64,
    ) -> Self {
        Self {
            id: None,
            order_id,
            client_order_id,
            counterparty_url,
            memo,
            sending_priority: sending_priority.clone(),
            amount,
            direction: Direction::Outgoing,
            created_at: now_ms(),
            execute_at,
            state: PaymentState::new(sending_priority),
            plugin_update: None,
            removed: false,
        }
    }

    /// Load a payment record by id.
    pub async fn find(
        id: &Uuid,
        store: &Store,
        removed: RemovedFilter,
    ) -> Result<Option<Self>, PaymentError> {
        let doc = store
            .get_outgoing_payment(&id.to_string(), removed)
            .await?;
        Ok(doc.map(serde_json::from_value).transpose()?)
    }

    /// Assign an id (when absent), reset the state machine from the sending
    /// priority, and persist the record.
    pub async fn init(&mut self, store: &Store) -> Result<(), PaymentError> {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        if self.state.is_initial() {
            self.state = PaymentState::new(self.sending_priority.clone());
        }
        self.save(store).await
    }

    /// Persist the record as a new document.
    pub async fn save(&self, store: &Store) -> Result<(), PaymentError> {
        self.id.ok_or(PaymentError::NotInitialized)?;
        store.save_outgoing_payment(&self.serialize()?).await?;
        Ok(())
    }

    /// Persist the given patch, or the full current serialized form when no
    /// patch is supplied.
    pub async fn update(&self, store: &Store, patch: Option<Value>) -> Result<(), PaymentError> {
        let id = self.id.ok_or(PaymentError::NotInitialized)?;
        let patch = match patch {
            Some(patch) => patch,
            None => self.serialize()?,
        };
        store
            .update_outgoing_payment(&id.to_string(), patch)
            .await?;
        Ok(())
    }

    /// Whether `execute_at` has passed.
    pub fn is_due(&self) -> bool {
        self.execute_at <= now_ms()
    }

    /// Drive the state machine one step and persist.
    ///
    /// A payment whose `execute_at` is still in the future is returned
    /// unchanged; callers re-poll. Re-processing while a plugin attempt is in
    /// flight is a no-op (idempotent for retry loops).
    pub async fn process(&mut self, store: &Store) -> Result<(), PaymentError> {
        if self.state.is_final() {
            return Ok(());
        }
        if !self.is_due() {
            debug!(payment = ?self.id, execute_at = self.execute_at, "payment not yet due");
            return Ok(());
        }
        if self.state.current_plugin.is_none() {
            self.state.process()?;
            self.update(store, None).await?;
        }
        Ok(())
    }

    /// Complete the payment with the in-flight plugin attempt and persist.
    pub async fn complete(&mut self, store: &Store) -> Result<(), PaymentError> {
        self.state.complete()?;
        self.update(store, None).await
    }

    /// Record the in-flight plugin attempt as failed and persist.
    pub async fn fail_current_plugin(&mut self, store: &Store) -> Result<(), PaymentError> {
        self.state.fail_current_plugin()?;
        self.update(store, None).await
    }

    /// Cancel the payment and persist.
    pub async fn cancel(&mut self, store: &Store) -> Result<(), PaymentError> {
        self.state.cancel()?;
        self.update(store, None).await
    }

    pub fn get_current_plugin(&self) -> Option<&PluginRun> {
        self.state.current_plugin.as_ref()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.is_in_progress()
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    /// Full JSON document form used for persistence and facade returns.
    pub fn serialize(&self) -> Result<Value, PaymentError> {
        Ok(serde_json::to_value(self)?)
    }

    /// The restricted payload handed to a plugin's `pay` operation.
    pub fn plugin_payload(&self) -> Result<Value, PaymentError> {
        let id = self.id.ok_or(PaymentError::NotInitialized)?;
        Ok(serde_json::json!({
            "id": id,
            "orderId": self.order_id,
            "memo": self.memo,
            "amount": self.amount.amount,
            "currency": self.amount.currency,
            "denomination": self.amount.denomination,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::MemoryDatabase;
    use std::sync::Arc;

    fn payment(execute_at: u64) -> OutgoingPayment {
        OutgoingPayment::new(
            Uuid::new_v4(),
            "co-1".into(),
            "slash://peer".into(),
            "memo".into(),
            vec!["p2sh".into(), "p2tr".into()],
            Amount::new("100", None, None).unwrap(),
            execute_at,
        )
    }

    async fn store() -> Store {
        let store = Store::new(Arc::new(MemoryDatabase::new()));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_assigns_id_and_persists() {
        let store = store().await;
        let mut p = payment(0);
        assert!(p.id.is_none());

        p.init(&store).await.unwrap();
        let id = p.id.unwrap();

        let found = OutgoingPayment::find(&id, &store, RemovedFilter::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, p);
    }

    #[tokio::test]
    async fn process_engages_first_plugin_and_persists() {
        let store = store().await;
        let mut p = payment(0);
        p.init(&store).await.unwrap();

        p.process(&store).await.unwrap();
        assert_eq!(p.get_current_plugin().unwrap().name, "p2sh");

        let found = OutgoingPayment::find(&p.id.unwrap(), &store, RemovedFilter::default())
            .await
            .unwrap()
            .unwrap();
        assert!(found.is_in_progress());
        assert_eq!(found.get_current_plugin().unwrap().name, "p2sh");
    }

    #[tokio::test]
    async fn process_is_gated_by_execute_at() {
        let store = store().await;
        let mut p = payment(now_ms() + 60_000);
        p.init(&store).await.unwrap();

        p.process(&store).await.unwrap();
        assert!(p.state.is_initial());
        assert!(p.get_current_plugin().is_none());
    }

    #[tokio::test]
    async fn process_is_idempotent_while_plugin_in_flight() {
        let store = store().await;
        let mut p = payment(0);
        p.init(&store).await.unwrap();

        p.process(&store).await.unwrap();
        p.process(&store).await.unwrap();
        assert_eq!(p.get_current_plugin().unwrap().name, "p2sh");
        assert!(p.state.tried_plugins.is_empty());
    }

    #[tokio::test]
    async fn plugin_payload_is_restricted() {
        let store = store().await;
        let mut p = payment(0);
        p.init(&store).await.unwrap();

        let payload = p.plugin_payload().unwrap();
        let obj = payload.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["amount", "currency", "denomination", "id", "memo", "orderId"]
        );
    }

    #[tokio::test]
    async fn save_before_init_is_refused() {
        let store = store().await;
        let p = payment(0);
        assert!(matches!(
            p.save(&store).await,
            Err(PaymentError::NotInitialized)
        ));
    }
}
