//! Durable store for orders and payments.
//!
//! All engine entities persist here as JSON documents keyed by their `id`.
//! Records are never physically deleted; `removed: true` marks a tombstone
//! that default reads skip. Updates are shallow merge patches that refuse
//! unknown fields, and saves are idempotent on `id` (a second save of the
//! same id is an error, never a silent overwrite).

pub mod database;

use anyhow::Result as AnyResult;
use database::{create_database, Database, DatabaseBackend, Tree};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

const ORDERS_TREE: &str = "orders";
const OUTGOING_TREE: &str = "payments_outgoing";
const INCOMING_TREE: &str = "payments_incoming";

/// Store failure kinds.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not ready; call init() first")]
    NotReady,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("document is missing a string `id` field")]
    MissingId,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Tombstone visibility for reads.
///
/// `Exclude` is the default: live records only. `Only` returns tombstones,
/// `Any` returns the record unconditionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemovedFilter {
    #[default]
    Exclude,
    Only,
    Any,
}

impl RemovedFilter {
    fn admits(&self, doc: &Value) -> bool {
        let removed = doc
            .get("removed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match self {
            RemovedFilter::Exclude => !removed,
            RemovedFilter::Only => removed,
            RemovedFilter::Any => true,
        }
    }
}

struct Trees {
    orders: Box<dyn Tree>,
    outgoing: Box<dyn Tree>,
    incoming: Box<dyn Tree>,
}

/// Durable CRUD over orders, outgoing payments, and incoming payments.
///
/// Single-writer per logical engine; writes are durably visible to the next
/// read in the same process.
pub struct Store {
    db: Arc<dyn Database>,
    trees: RwLock<Option<Trees>>,
}

impl Store {
    /// Create a store over an already-constructed database.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            trees: RwLock::new(None),
        }
    }

    /// Create a store over the given backend and data directory.
    pub fn open<P: AsRef<Path>>(data_dir: P, backend: DatabaseBackend) -> AnyResult<Self> {
        Ok(Self::new(create_database(data_dir, backend)?))
    }

    /// Open the entity trees. Every operation before this returns
    /// [`StoreError::NotReady`].
    pub async fn init(&self) -> Result<(), StoreError> {
        let mut guard = self.trees.write().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(Trees {
            orders: self.db.open_tree(ORDERS_TREE)?,
            outgoing: self.db.open_tree(OUTGOING_TREE)?,
            incoming: self.db.open_tree(INCOMING_TREE)?,
        });
        info!("store initialized");
        Ok(())
    }

    pub async fn is_ready(&self) -> bool {
        self.trees.read().await.is_some()
    }

    // === Orders ===

    pub async fn save_order(&self, order: &Value) -> Result<(), StoreError> {
        self.save(|t| &t.orders, order).await
    }

    pub async fn get_order(
        &self,
        id: &str,
        removed: RemovedFilter,
    ) -> Result<Option<Value>, StoreError> {
        self.get(|t| &t.orders, id, removed).await
    }

    pub async fn update_order(&self, id: &str, patch: Value) -> Result<Value, StoreError> {
        self.update(|t| &t.orders, id, patch).await
    }

    // === Outgoing payments ===

    pub async fn save_outgoing_payment(&self, payment: &Value) -> Result<(), StoreError> {
        self.save(|t| &t.outgoing, payment).await
    }

    pub async fn get_outgoing_payment(
        &self,
        id: &str,
        removed: RemovedFilter,
    ) -> Result<Option<Value>, StoreError> {
        self.get(|t| &t.outgoing, id, removed).await
    }

    pub async fn update_outgoing_payment(
        &self,
        id: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        self.update(|t| &t.outgoing, id, patch).await
    }

    /// All outgoing payments matching the conjunction of the filter's scalar
    /// equalities.
    pub async fn get_outgoing_payments(
        &self,
        filter: &Map<String, Value>,
        removed: RemovedFilter,
    ) -> Result<Vec<Value>, StoreError> {
        self.query(|t| &t.outgoing, filter, removed).await
    }

    // === Incoming payments ===

    pub async fn save_incoming_payment(&self, payment: &Value) -> Result<(), StoreError> {
        self.save(|t| &t.incoming, payment).await
    }

    pub async fn get_incoming_payment(
        &self,
        id: &str,
        removed: RemovedFilter,
    ) -> Result<Option<Value>, StoreError> {
        self.get(|t| &t.incoming, id, removed).await
    }

    pub async fn update_incoming_payment(
        &self,
        id: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        self.update(|t| &t.incoming, id, patch).await
    }

    pub async fn get_incoming_payments(
        &self,
        filter: &Map<String, Value>,
        removed: RemovedFilter,
    ) -> Result<Vec<Value>, StoreError> {
        self.query(|t| &t.incoming, filter, removed).await
    }

    // === Generic document operations ===

    async fn save(
        &self,
        tree: impl Fn(&Trees) -> &Box<dyn Tree>,
        doc: &Value,
    ) -> Result<(), StoreError> {
        let id = doc_id(doc)?;
        let guard = self.trees.read().await;
        let trees = guard.as_ref().ok_or(StoreError::NotReady)?;
        let tree = tree(trees);

        if tree.contains_key(id.as_bytes())? {
            return Err(StoreError::DuplicateId(id));
        }
        tree.insert(id.as_bytes(), &serde_json::to_vec(doc)?)?;
        debug!(id = %id, "saved record");
        Ok(())
    }

    async fn get(
        &self,
        tree: impl Fn(&Trees) -> &Box<dyn Tree>,
        id: &str,
        removed: RemovedFilter,
    ) -> Result<Option<Value>, StoreError> {
        let guard = self.trees.read().await;
        let trees = guard.as_ref().ok_or(StoreError::NotReady)?;

        let Some(raw) = tree(trees).get(id.as_bytes())? else {
            return Ok(None);
        };
        let doc: Value = serde_json::from_slice(&raw)?;
        Ok(removed.admits(&doc).then_some(doc))
    }

    async fn update(
        &self,
        tree: impl Fn(&Trees) -> &Box<dyn Tree>,
        id: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidPatch("patch must be an object".into()));
        };

        let guard = self.trees.read().await;
        let trees = guard.as_ref().ok_or(StoreError::NotReady)?;
        let tree = tree(trees);

        let raw = tree
            .get(id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut doc: Value = serde_json::from_slice(&raw)?;
        let fields = doc
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidPatch("stored record is not an object".into()))?;

        // Shallow merge; unknown fields are rejected before anything mutates.
        if let Some(unknown) = patch.keys().find(|k| !fields.contains_key(*k)) {
            return Err(StoreError::InvalidPatch(format!("unknown field: {unknown}")));
        }
        for (key, value) in patch {
            fields.insert(key, value);
        }

        tree.insert(id.as_bytes(), &serde_json::to_vec(&doc)?)?;
        debug!(id = %id, "updated record");
        Ok(doc)
    }

    async fn query(
        &self,
        tree: impl Fn(&Trees) -> &Box<dyn Tree>,
        filter: &Map<String, Value>,
        removed: RemovedFilter,
    ) -> Result<Vec<Value>, StoreError> {
        let guard = self.trees.read().await;
        let trees = guard.as_ref().ok_or(StoreError::NotReady)?;

        let mut out = Vec::new();
        for (_, raw) in tree(trees).scan()? {
            let doc: Value = serde_json::from_slice(&raw)?;
            if !removed.admits(&doc) {
                continue;
            }
            let matches = filter
                .iter()
                .all(|(key, expected)| doc.get(key) == Some(expected));
            if matches {
                out.push(doc);
            }
        }
        Ok(out)
    }
}

fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::MissingId)
}
