//! Slashpay payment-abstraction engine.
//!
//! Given a counterparty identified by a single static URL that resolves to a
//! catalogue of payment endpoints, the engine orchestrates payments over a
//! pluggable set of payment methods: it retries across plugins under a
//! caller-supplied priority, persists every intermediate state so payments
//! survive restarts, and — in the receive direction — publishes this peer's
//! own endpoint catalogue and reconciles plugin-delivered receipts into
//! incoming payment records.
//!
//! ## Architecture
//!
//! - [`storage`] — durable CRUD for orders and payments with soft deletes.
//! - [`amount`] — validated `(amount, currency, denomination)` triples.
//! - [`payment`] — the per-payment state machine, payment records, orders,
//!   and the send/receive coordinators.
//! - [`plugin`] — the plugin contract and the manager that loads,
//!   validates, and dispatches to payment-method plugins.
//! - [`transport`] — the key/value-over-URL drive the catalogues live on.
//! - [`manager`] — the [`PaymentManager`] facade tying it all together.
//!
//! Payment-method semantics (invoice formats, chain confirmations, unit
//! conversion) live in plugins, never in the engine.

pub mod amount;
pub mod config;
pub mod manager;
pub mod payment;
pub mod plugin;
pub mod storage;
pub mod transport;
pub mod utils;

pub use amount::{Amount, AmountError, Denomination};
pub use config::Config;
pub use manager::{InvoiceOptions, PaymentManager, SlashpayError};
pub use payment::incoming::{IncomingPayment, IncomingState};
pub use payment::object::OutgoingPayment;
pub use payment::order::{OrderParams, OrderState, PaymentOrder};
pub use payment::receiver::PaymentReceiver;
pub use payment::sender::PaymentSender;
pub use payment::state::{InternalState, PaymentState, PluginRun, PluginRunState};
pub use plugin::{
    NotificationSender, Plugin, PluginError, PluginManager, PluginManifest, PluginModule,
};
pub use storage::{RemovedFilter, Store, StoreError};
pub use transport::{CreateOptions, TransportConnector, TransportError};

/// Common result alias for engine operations.
pub type Result<T> = std::result::Result<T, SlashpayError>;
