//! The daemon and its admin interface.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use eventd::config::Config;
use eventd::daemon::start::start_eventd_daemon;
use eventd::test::{self, CallbackServer};


async fn start_daemon(
    config: Config
) -> (String, JoinHandle<Result<(), eventd::commons::error::Error>>) {
    test::init_logging();
    let (tx, rx) = oneshot::channel::<SocketAddr>();
    let daemon = tokio::spawn(start_eventd_daemon(Arc::new(config), Some(tx)));
    let addr = rx.await.unwrap();
    (format!("http://{addr}"), daemon)
}

#[tokio::test]
async fn admin_interface() {
    let callback = CallbackServer::start(vec![200]).await;
    let (base, daemon) = start_daemon(
        Config::test(&test::mem_storage())
    ).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Register a subscriber.
    let sub = json!({
        "subscription_id": 1,
        "subscription_name": "hosts",
        "callback_url": callback.url(),
        "confirm_mode": "httpstatus",
        "confirm_pattern": "200",
        "subscription_form": "hostcreate",
        "bk_supplier_account": "0",
    });
    let res = client.post(format!("{base}/subscriptions"))
        .json(&sub).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("{base}/subscriptions/1"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let shown: Value = res.json().await.unwrap();
    assert_eq!(shown["subscription_name"], "hosts");

    let listed: Vec<Value> = client.get(format!("{base}/subscriptions"))
        .send().await.unwrap()
        .json().await.unwrap();
    assert_eq!(listed.len(), 1);

    // Feed a change once the pipeline knows the subscriber.
    let metrics = format!("{base}/metrics");
    for _ in 0..1000 {
        let text = client.get(&metrics).send().await.unwrap()
            .text().await.unwrap();
        if text.contains("eventd_subscriptions 1") {
            break
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let res = client.post(format!("{base}/changes/host"))
        .json(&json!([{
            "operation": "insert",
            "document": {"bk_host_id": 5, "bk_host_innerip": "10.0.0.5"},
        }]))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cursors: Vec<String> = res.json().await.unwrap();
    assert_eq!(cursors.len(), 1);

    test::wait_for(|| callback.received() == 1).await;
    let body = &callback.bodies()[0];
    assert_eq!(body["obj_type"], "host");
    assert_eq!(body["distribution_id"], 1);
    assert_eq!(body["data"][0]["cur_data"]["bk_host_id"], 5);

    let stats_url = format!("{base}/subscriptions/1/statistics");
    let mut stats = Value::Null;
    for _ in 0..1000 {
        stats = client.get(&stats_url).send().await.unwrap()
            .json().await.unwrap();
        if stats["total"] == 1 {
            break
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(stats, json!({"total": 1, "failure": 0}));

    let text = client.get(&metrics).send().await.unwrap()
        .text().await.unwrap();
    assert!(text.contains("eventd_callback_total{subscription=\"1\"} 1"));

    let res = client.delete(format!("{base}/subscriptions/1"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client.get(&stats_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let error: Value = res.json().await.unwrap();
    assert_eq!(error["label"], "api-unknown-subscription");

    daemon.abort();
}

#[tokio::test]
async fn admin_interface_rejects_bad_input() {
    let (base, daemon) = start_daemon(
        Config::test(&test::mem_storage())
    ).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{base}/nothing-here"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.post(format!("{base}/changes/spaceship"))
        .json(&json!([{"operation": "insert", "document": {}}]))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.post(format!("{base}/subscriptions"))
        .body("not json")
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(format!("{base}/subscriptions/one"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.put(format!("{base}/subscriptions"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    // A subscription without a callback is refused.
    let res = client.post(format!("{base}/subscriptions"))
        .json(&json!({
            "subscription_id": 3,
            "callback_url": "",
            "subscription_form": "hostcreate",
        }))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    daemon.abort();
}

#[tokio::test]
async fn configured_subscriptions_are_served() {
    let callback = CallbackServer::start(vec![200]).await;
    let mut config = Config::test(&test::mem_storage());
    config.subscriptions = vec![
        test::subscription(4, &callback.url(), "hostcreate"),
    ];
    let (base, daemon) = start_daemon(config).await;
    let client = reqwest::Client::new();

    let res = client.post(format!("{base}/changes/host"))
        .json(&json!([
            {"operation": "insert", "document": {"bk_host_id": 1}},
            {"operation": "insert", "document": {"bk_host_id": 2}},
        ]))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    test::wait_for(|| callback.received() == 2).await;
    let ids: Vec<_> = callback.bodies().iter()
        .map(|body| body["distribution_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);

    daemon.abort();
}
