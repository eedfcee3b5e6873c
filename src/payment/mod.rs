//! Payment domain: per-payment state machine, payment records, orders, and
//! the send/receive coordinators built on top of them.

pub mod incoming;
pub mod object;
pub mod order;
pub mod receiver;
pub mod sender;
pub mod state;

use crate::amount::AmountError;
use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use state::StateError;
use thiserror::Error;

/// Which way money moves for a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    Incoming,
    #[serde(rename = "OUT")]
    Outgoing,
}

/// Errors raised by payment records.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment has not been initialized")]
    NotInitialized,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
