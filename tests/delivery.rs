//! Delivering host changes to subscriber callbacks.

use chrono::{Duration, Utc};
use eventd::api::{ConfirmMode, ResourceKind};
use eventd::server::source::Change;
use eventd::test::{self, CallbackServer};

mod common;


/// Each host creation results in one callback carrying the next
/// distribution id of the subscriber.
#[tokio::test]
async fn host_create_is_delivered() {
    let callback = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate"),
    ]).await;

    server.create_host(1);
    test::wait_for(|| callback.received() == 1).await;

    let body = &callback.bodies()[0];
    assert_eq!(body["obj_type"], "host");
    assert_eq!(body["action"], "create");
    assert_eq!(body["event_type"], "instdata");
    assert_eq!(body["distribution_id"], 1);
    assert_eq!(body["subscription_id"], 1);
    assert_eq!(body["supplier_account"], "0");
    assert_eq!(body["data"][0]["cur_data"]["bk_host_id"], 1);
    assert!(body["data"][0]["pre_data"].is_null());
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    server.create_host(2);
    test::wait_for(|| callback.received() == 2).await;
    let body = &callback.bodies()[1];
    assert_eq!(body["distribution_id"], 2);
    assert_eq!(body["data"][0]["cur_data"]["bk_host_id"], 2);

    server.wait_for_stats(1, 2, 0).await;
    server.stop().await;
}

/// Callbacks reach a subscriber in the order the changes happened.
#[tokio::test]
async fn callbacks_keep_change_order() {
    let callback = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate,hostdelete"),
    ]).await;

    for host_id in 1..=10 {
        server.create_host(host_id);
        server.delete_host(host_id);
    }
    test::wait_for(|| callback.received() == 20).await;

    let bodies = callback.bodies();
    for (idx, body) in bodies.iter().enumerate() {
        assert_eq!(body["distribution_id"], idx as i64 + 1);
        let host_id = idx as u64 / 2 + 1;
        if idx % 2 == 0 {
            assert_eq!(body["action"], "create");
            assert_eq!(body["data"][0]["cur_data"]["bk_host_id"], host_id);
        }
        else {
            assert_eq!(body["action"], "delete");
            assert_eq!(body["data"][0]["pre_data"]["bk_host_id"], host_id);
        }
    }
    server.stop().await;
}

/// Only the configured status code confirms a callback, everything else
/// counts as exactly one failure and is not retried.
#[tokio::test]
async fn status_code_confirms_callback() {
    let callback = CallbackServer::start(vec![500, 200, 404]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate"),
    ]).await;

    server.create_host(1);
    server.create_host(2);
    server.create_host(3);
    test::wait_for(|| callback.received() == 3).await;
    server.wait_for_stats(1, 3, 2).await;

    // Nothing is posted again.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(callback.received(), 3);
    let ids: Vec<_> = callback.bodies().iter()
        .map(|body| body["distribution_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    server.stop().await;
}

#[tokio::test]
async fn regex_confirms_callback_body() {
    let callback = CallbackServer::start(vec![500]).await;
    let mut sub = test::subscription(1, &callback.url(), "hostcreate");
    sub.confirm_mode = ConfirmMode::Regular;
    sub.confirm_pattern = "^ok$".into();
    let server = common::TestServer::start(vec![sub]).await;

    // The body is what counts, not the status.
    server.create_host(1);
    test::wait_for(|| callback.received() == 1).await;
    server.wait_for_stats(1, 1, 0).await;

    server.stop().await;
}

/// Changes older than the fuse threshold never reach a subscriber.
#[tokio::test]
async fn fused_events_are_not_delivered() {
    let callback = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate"),
    ]).await;

    server.change_log.append_at(
        ResourceKind::Host,
        Utc::now() - Duration::hours(4),
        Change::insert(common::host_doc(1)),
    );
    server.create_host(2);
    test::wait_for(|| callback.received() == 1).await;

    let body = &callback.bodies()[0];
    assert_eq!(body["data"][0]["cur_data"]["bk_host_id"], 2);
    assert_eq!(body["distribution_id"], 1);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(callback.received(), 1);
    server.wait_for_stats(1, 1, 0).await;

    server.stop().await;
}

/// Each subscriber receives only the fields it asked for.
#[tokio::test]
async fn payload_is_cut_per_subscriber() {
    let narrow = CallbackServer::start(vec![200]).await;
    let full = CallbackServer::start(vec![200]).await;

    let mut narrow_sub = test::subscription(1, &narrow.url(), "hostcreate");
    narrow_sub.fields = vec!["bk_host_id".into()];
    let mut wide_sub = test::subscription(2, &full.url(), "hostcreate");
    wide_sub.fields = vec!["bk_host_id".into(), "bk_host_innerip".into()];

    let server = common::TestServer::start(vec![narrow_sub, wide_sub]).await;

    server.create_host(7);
    test::wait_for(|| narrow.received() == 1 && full.received() == 1).await;

    let narrow_body = &narrow.bodies()[0];
    let doc = narrow_body["data"][0]["cur_data"].as_object().unwrap();
    assert_eq!(doc.len(), 1);
    assert_eq!(doc["bk_host_id"], 7);

    let full_body = &full.bodies()[0];
    let doc = full_body["data"][0]["cur_data"].as_object().unwrap();
    assert_eq!(doc.len(), 2);
    assert_eq!(doc["bk_host_innerip"], "10.0.0.7");

    // Distribution ids are counted per subscriber.
    assert_eq!(narrow_body["distribution_id"], 1);
    assert_eq!(full_body["distribution_id"], 1);

    server.stop().await;
}

/// A failing subscriber does not hold up the others.
#[tokio::test]
async fn failing_subscriber_is_isolated() {
    let good = CallbackServer::start(vec![200]).await;
    let bad = CallbackServer::start(vec![503]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &good.url(), "hostcreate"),
        test::subscription(2, &bad.url(), "hostcreate"),
    ]).await;

    for host_id in 1..=3 {
        server.create_host(host_id);
    }
    test::wait_for(|| good.received() == 3 && bad.received() == 3).await;
    server.wait_for_stats(1, 3, 0).await;
    server.wait_for_stats(2, 3, 3).await;

    server.stop().await;
}
