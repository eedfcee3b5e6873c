//! Plugin system: the contract payment-method plugins implement, and the
//! manager that loads, validates, dispatches to, and stops them.

pub mod manager;
pub mod traits;

pub use manager::{PluginManager, RegistryEntry, RpcHandle};
pub use traits::{
    NotificationSender, Plugin, PluginError, PluginManifest, PluginModule, PAYMENT_PLUGIN_TYPE,
    RECEIVE_PAYMENT_EVENT, RPC_PAY, RPC_UPDATE_PAYMENT,
};
