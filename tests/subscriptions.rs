//! Subscription changes taking effect while the pipeline runs.

use eventd::test::{self, CallbackServer};

mod common;


#[tokio::test]
async fn narrowed_form_stops_matching_events() {
    let callback = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate,hostdelete"),
    ]).await;

    server.create_host(1);
    test::wait_for(|| callback.received() == 1).await;

    server.eventd.upsert_subscription(
        test::subscription(1, &callback.url(), "hostdelete")
    ).unwrap();
    server.wait_for_subscribers("hostcreate", &[]).await;
    server.wait_for_subscribers("hostdelete", &[1]).await;

    server.create_host(2);
    server.delete_host(2);
    test::wait_for(|| callback.received() == 2).await;

    let body = &callback.bodies()[1];
    assert_eq!(body["action"], "delete");
    assert_eq!(body["data"][0]["pre_data"]["bk_host_id"], 2);
    assert_eq!(body["distribution_id"], 2);

    server.stop().await;
}

#[tokio::test]
async fn new_subscription_receives_later_changes() {
    let first = CallbackServer::start(vec![200]).await;
    let second = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &first.url(), "hostcreate"),
    ]).await;

    server.create_host(1);
    test::wait_for(|| first.received() == 1).await;

    server.eventd.upsert_subscription(
        test::subscription(2, &second.url(), "hostcreate")
    ).unwrap();
    server.wait_for_subscribers("hostcreate", &[1, 2]).await;

    server.create_host(2);
    test::wait_for(|| first.received() == 2 && second.received() == 1)
        .await;
    assert_eq!(second.bodies()[0]["data"][0]["cur_data"]["bk_host_id"], 2);
    assert_eq!(second.bodies()[0]["distribution_id"], 1);

    server.stop().await;
}

/// Moving the callback takes effect without restarting the pusher.
#[tokio::test]
async fn callback_url_change_is_picked_up() {
    let old = CallbackServer::start(vec![200]).await;
    let new = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &old.url(), "hostcreate"),
    ]).await;

    server.create_host(1);
    test::wait_for(|| old.received() == 1).await;

    server.eventd.upsert_subscription(
        test::subscription(1, &new.url(), "hostcreate")
    ).unwrap();
    let eventd = server.eventd.clone();
    let new_url = new.url();
    test::wait_for(|| {
        eventd.registry().find_subscription(1)
            .map(|sub| sub.callback_url == new_url)
            .unwrap_or(false)
    }).await;

    server.create_host(2);
    test::wait_for(|| new.received() == 1).await;
    assert_eq!(old.received(), 1);
    assert_eq!(new.bodies()[0]["distribution_id"], 2);

    server.stop().await;
}

/// Removing a subscription stops its pusher and drops its queue.
#[tokio::test]
async fn deleted_subscription_is_torn_down() {
    let callback = CallbackServer::start(vec![200]).await;
    let server = common::TestServer::start(vec![
        test::subscription(1, &callback.url(), "hostcreate"),
    ]).await;

    let eventd = server.eventd.clone();
    test::wait_for(|| eventd.pool().ids() == vec![1]).await;

    server.eventd.delete_subscription(1).unwrap();
    server.wait_for_subscribers("hostcreate", &[]).await;
    test::wait_for(|| eventd.pool().is_empty()).await;

    server.create_host(1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(callback.received(), 0);
    assert!(server.eventd.subscription_statistics(1).await.is_err());

    let ctx = server.eventd.context();
    assert_eq!(
        ctx.store.llen(&ctx.keys.subscriber_queue(1)).await.unwrap(), 0
    );

    server.stop().await;
}
