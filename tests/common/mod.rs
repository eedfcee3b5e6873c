//! Shared test fixtures: scripted payment plugins and an engine test bed
//! wired over the in-process transport.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use slashpay::plugin::traits::{
    PluginModule, RECEIVE_PAYMENT_EVENT, RPC_PAY, RPC_UPDATE_PAYMENT,
};
use slashpay::storage::database::MemoryDatabase;
use slashpay::transport::memory::MemoryTransport;
use slashpay::transport::{public_index_path, public_plugin_path, TransportConnector};
use slashpay::{
    Config, CreateOptions, NotificationSender, PaymentManager, Plugin, PluginError,
    PluginManifest, Store,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What a scripted plugin reports right after `pay` is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayBehavior {
    /// Report `pluginState: "success"`.
    Success,
    /// Report `pluginState: "failed"`.
    Fail,
    /// Report an intermediate state and wait for a user update.
    ActionRequired,
    /// Never call back.
    Silent,
}

/// Observable side effects of one scripted plugin.
#[derive(Clone, Default)]
pub struct PluginLog {
    pub pays: Arc<Mutex<Vec<Value>>>,
    pub events: Arc<Mutex<Vec<Value>>>,
    pub user_updates: Arc<Mutex<Vec<Value>>>,
}

pub struct ScriptedPlugin {
    name: String,
    behavior: PayBehavior,
    log: PluginLog,
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
                self.log.pays.lock().unwrap().push(args.clone());
                let order_id = args["payload"]["orderId"].clone();
                let report = |state: &str| {
                    json!({
                        "type": "payment_update",
                        "pluginName": self.name,
                        "orderId": order_id,
                        "pluginState": state,
                    })
                };
                match self.behavior {
                    PayBehavior::Success => callback.send(report("success"))?,
                    PayBehavior::Fail => callback.send(report("failed"))?,
                    PayBehavior::ActionRequired => callback.send(report("action_required"))?,
                    PayBehavior::Silent => {}
                }
            }
            RPC_UPDATE_PAYMENT => {
                self.log.user_updates.lock().unwrap().push(args);
            }
            other => {
                return Err(PluginError::Rpc {
                    method: other.to_string(),
                    message: "unknown method".into(),
                })
            }
        }
        Ok(())
    }

    async fn on_event(
        &self,
        _event: &str,
        payload: Value,
        _callback: NotificationSender,
    ) -> Result<(), PluginError> {
        self.log.events.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct ScriptedModule {
    pub name: String,
    pub behavior: PayBehavior,
    pub log: PluginLog,
}

impl ScriptedModule {
    pub fn new(name: &str, behavior: PayBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            log: PluginLog::default(),
        }
    }
}

#[async_trait]
impl PluginModule for ScriptedModule {
    async fn init(&self, _storage: Arc<Store>) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(ScriptedPlugin {
            name: self.name.clone(),
            behavior: self.behavior,
            log: self.log.clone(),
        }))
    }

    async fn get_manifest(&self) -> Result<PluginManifest, PluginError> {
        Ok(PluginManifest {
            name: self.name.clone(),
            kind: "payment".into(),
            description: None,
            version: Some("1.0.0".into()),
            rpc: vec![RPC_PAY.into(), RPC_UPDATE_PAYMENT.into()],
            events: vec![RECEIVE_PAYMENT_EVENT.into()],
        })
    }
}

/// A ready engine over memory storage and a shared in-process drive.
pub struct TestBed {
    pub manager: Arc<PaymentManager>,
    pub transport: Arc<MemoryTransport>,
    pub user_rx: mpsc::UnboundedReceiver<Value>,
    pub logs: HashMap<String, PluginLog>,
}

/// Route engine logs through the test harness when `RUST_LOG` is set.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

impl TestBed {
    /// Spin up an engine with the given scripted plugins registered and
    /// configured.
    pub async fn new(plugins: &[(&str, PayBehavior)]) -> Self {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new("testbed"));
        let store = Arc::new(Store::new(Arc::new(MemoryDatabase::new())));

        let config = Config {
            plugins: plugins.iter().map(|(name, _)| name.to_string()).collect(),
            ..Config::default()
        };

        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let manager = PaymentManager::with_store(config, store, transport.clone(), user_tx);
        manager.init().await.unwrap();

        let mut logs = HashMap::new();
        for (name, behavior) in plugins {
            let module = ScriptedModule::new(name, *behavior);
            logs.insert(name.to_string(), module.log.clone());
            manager
                .plugin_manager()
                .register_module(name.to_string(), Arc::new(module))
                .await;
        }

        Self {
            manager,
            transport,
            user_rx,
            logs,
        }
    }

    /// Publish a counterparty catalogue (index plus per-plugin endpoint
    /// files) on the shared drive and return its URL.
    pub async fn seed_counterparty(&self, plugins: &[&str]) -> String {
        let mut endpoints = Map::new();
        for name in plugins {
            let url = self
                .transport
                .create(
                    &public_plugin_path(name),
                    json!({ "address": format!("addr-{name}") }),
                    CreateOptions::default(),
                )
                .await
                .unwrap();
            endpoints.insert(name.to_string(), Value::String(url));
        }
        self.transport
            .create(
                &public_index_path(),
                json!({ "paymentEndpoints": endpoints }),
                CreateOptions::default(),
            )
            .await
            .unwrap()
    }

    /// Drain every queued user notification.
    pub fn user_notifications(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.user_rx.try_recv().ok()).collect()
    }
}
