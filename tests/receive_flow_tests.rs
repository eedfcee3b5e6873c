//! End-to-end receive flows: catalogue publication, invoices, and
//! reconciliation of plugin-delivered receipts.

mod common;

use common::{PayBehavior, TestBed};
use serde_json::json;
use slashpay::storage::RemovedFilter;
use slashpay::transport::TransportConnector;

#[tokio::test]
async fn receive_payments_publishes_the_catalogue() {
    let bed = TestBed::new(&[("p2sh", PayBehavior::Success), ("p2tr", PayBehavior::Success)]).await;

    let url = bed.manager.receive_payments().await.unwrap();

    let index = bed.transport.read_remote(&url).await.unwrap().unwrap();
    let endpoints = index["paymentEndpoints"].as_object().unwrap();
    assert_eq!(endpoints.len(), 2);
    for name in ["p2sh", "p2tr"] {
        assert!(endpoints[name]
            .as_str()
            .unwrap()
            .ends_with(&format!("/public/slashpay/{name}/slashpay.json")));
    }

    // Every plugin got the receive event.
    for name in ["p2sh", "p2tr"] {
        assert_eq!(bed.logs[name].events.lock().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn ready_to_receive_provisions_the_plugin_file() {
    let bed = TestBed::new(&[("p2sh", PayBehavior::Success)]).await;
    bed.manager.receive_payments().await.unwrap();

    // The plugin answers the receive event by provisioning its endpoint
    // document.
    bed.manager
        .entry_point_for_plugin(json!({
            "type": "ready_to_receive",
            "pluginName": "p2sh",
            "data": {"address": "addr-1"},
            "amountWasSpecified": false,
        }))
        .await
        .unwrap();

    let url = bed
        .transport
        .get_url("/public/slashpay/p2sh/slashpay.json")
        .await
        .unwrap();
    assert_eq!(
        bed.transport.read_remote(&url).await.unwrap(),
        Some(json!({"address": "addr-1"}))
    );
}

#[tokio::test]
async fn private_payment_file_requires_client_order_id() {
    let bed = TestBed::new(&[("p2sh", PayBehavior::Success)]).await;

    let err = bed
        .manager
        .create_payment_file(&json!({
            "pluginName": "p2sh",
            "data": {"invoice": "lnbc..."},
            "amountWasSpecified": true,
        }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("client order id"));

    let url = bed
        .manager
        .create_payment_file(&json!({
            "pluginName": "p2sh",
            "clientOrderId": "inv-1",
            "data": {"invoice": "lnbc..."},
            "amountWasSpecified": true,
        }))
        .await
        .unwrap();
    assert!(url.contains("/slashpay/inv-1/p2sh/"));
    assert!(bed.transport.is_encrypted(&url).await);
}

#[tokio::test]
async fn invoice_reconciles_across_partial_payments() {
    let bed = TestBed::new(&[("p2sh", PayBehavior::Success)]).await;

    let url = bed
        .manager
        .create_invoice("inv-9", "50", None)
        .await
        .unwrap();
    assert!(bed.transport.is_encrypted(&url).await);

    // First partial payment of 30 arrives from the plugin.
    bed.manager
        .entry_point_for_plugin(json!({
            "type": "payment_new",
            "isPersonalPayment": true,
            "clientOrderId": "inv-9",
            "amount": "30",
            "currency": "BTC",
            "denomination": "BASE",
            "pluginName": "p2sh",
        }))
        .await
        .unwrap();

    // A continuation invoice for the missing 20 was dispatched to plugins
    // (the catalogue-refresh event that follows carries no invoice fields).
    let continuation = {
        let events = bed.logs["p2sh"].events.lock().unwrap();
        events
            .iter()
            .rev()
            .find(|e| e.get("clientOrderId").is_some())
            .cloned()
            .unwrap()
    };
    assert_eq!(continuation["clientOrderId"], "inv-9");
    assert_eq!(continuation["expectedAmount"], "20");

    // The matching 20 completes the invoice.
    bed.manager
        .entry_point_for_plugin(json!({
            "type": "payment_new",
            "isPersonalPayment": true,
            "clientOrderId": "inv-9",
            "amount": "20",
            "currency": "BTC",
            "denomination": "BASE",
            "pluginName": "p2sh",
        }))
        .await
        .unwrap();

    let mut filter = serde_json::Map::new();
    filter.insert("clientOrderId".into(), json!("inv-9"));
    let records = bed
        .manager
        .store()
        .get_incoming_payments(&filter, RemovedFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["internalState"], "COMPLETED");
    assert_eq!(records[0]["receivedByPlugins"].as_array().unwrap().len(), 2);
    assert_eq!(records[0]["amount"]["amount"], "50");
}

#[tokio::test]
async fn unsolicited_payment_creates_a_completed_record() {
    let mut bed = TestBed::new(&[("p2tr", PayBehavior::Success)]).await;
    bed.manager.receive_payments().await.unwrap();

    bed.manager
        .entry_point_for_plugin(json!({
            "type": "payment_new",
            "pluginName": "p2tr",
            "amount": "25",
            "rawData": {"txid": "feed"},
        }))
        .await
        .unwrap();

    let records = bed
        .manager
        .store()
        .get_incoming_payments(&serde_json::Map::new(), RemovedFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["internalState"], "COMPLETED");
    assert_eq!(records[0]["amount"]["amount"], "25");
    assert_eq!(records[0]["amount"]["currency"], "BTC");

    // The reconciled record was surfaced to the user.
    let notifications = bed.user_notifications();
    assert!(notifications
        .iter()
        .any(|n| n["internalState"] == json!("COMPLETED")));
}

#[tokio::test]
async fn unmatched_payload_types_reach_the_user() {
    let mut bed = TestBed::new(&[("p2sh", PayBehavior::Success)]).await;

    bed.manager
        .entry_point_for_plugin(json!({
            "type": "channel_opened",
            "pluginName": "p2sh",
        }))
        .await
        .unwrap();

    let notifications = bed.user_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["type"], "channel_opened");
}
