//! Socket sessions end to end: start frame, call multiplexing, pub/sub,
//! targeted delivery, presence, and teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use farcall_core::prelude::*;
use farcall_test::{wait_for, TestApp, TestServer, TestSocket};
use serde_json::json;

fn calc() -> Service {
    Service::new("Calc").method("Add", |x: i64, y: i64| async move {
        Ok::<_, MethodError>(x + y)
    })
}

fn user_from_query(ctx: CallContext, parts: &http::request::Parts) -> CallContext {
    let user = parts
        .uri
        .query()
        .and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("uid="))
        })
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    ctx.with(UserId(user))
}

#[tokio::test]
async fn start_frame_then_call_result() {
    let server = Server::builder(ServerConfig::default()).service(calc()).build();
    let remote = TestServer::spawn(&server).await;

    let mut socket = remote.connect().await;
    let conn = socket.expect_start().await;
    assert!(conn >= 1);

    socket
        .call(json!([{"id": "1", "name": "Calc.Add", "args": [2, 3]}]))
        .await;
    assert_eq!(
        socket.recv_json().await,
        json!({"action": "result", "body": [{"id": "1", "data": 5, "error": ""}]})
    );
}

#[tokio::test]
async fn empty_and_malformed_call_frames_still_get_results() {
    let server = Server::builder(ServerConfig::default()).service(calc()).build();
    let remote = TestServer::spawn(&server).await;

    let mut socket = remote.connect().await;
    socket.expect_start().await;

    // An empty batch is a valid call frame and answers an empty result.
    socket.call(json!([])).await;
    assert_eq!(
        socket.recv_json().await,
        json!({"action": "result", "body": []})
    );

    // A body that is not a batch decodes to nothing; the reply is still sent.
    socket.call(json!("not a batch")).await;
    assert_eq!(
        socket.recv_json().await,
        json!({"action": "result", "body": []})
    );

    // The session keeps serving afterwards.
    socket
        .call(json!([{"id": "1", "name": "Calc.Add", "args": [2, 3]}]))
        .await;
    assert_eq!(
        socket.recv_json().await,
        json!({"action": "result", "body": [{"id": "1", "data": 5, "error": ""}]})
    );
}

#[tokio::test]
async fn publish_reaches_subscribers_only() {
    let server = Server::builder(ServerConfig::default()).build();
    let remote = TestServer::spawn(&server).await;
    let hub = server.hub();

    let mut subscriber = remote.connect().await;
    subscriber.expect_start().await;
    let mut bystander = remote.connect().await;
    bystander.expect_start().await;

    subscriber.subscribe("ticker").await;
    wait_for("subscription applied", || {
        let hub = hub.clone();
        async move { hub.stats().await.subscribers.get("ticker") == Some(&1) }
    })
    .await;

    hub.publish("ticker", json!({"price": 42})).await;

    assert_eq!(
        subscriber.recv_json().await,
        json!({
            "action": "event",
            "body": {"name": "ticker", "value": {"price": 42}}
        })
    );
    bystander.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn targeted_publish_selects_one_connection() {
    let server = Server::builder(ServerConfig::default()).build();
    let remote = TestServer::spawn(&server).await;
    let hub = server.hub();

    let mut first = remote.connect().await;
    first.expect_start().await;
    let mut second = remote.connect().await;
    let second_conn = second.expect_start().await;

    first.subscribe("t").await;
    second.subscribe("t").await;
    wait_for("both subscriptions applied", || {
        let hub = hub.clone();
        async move { hub.stats().await.subscribers.get("t") == Some(&2) }
    })
    .await;

    hub.publish_to("t", "v", vec![ConnId(second_conn)]).await;

    assert_eq!(second.recv_json().await["body"]["value"], "v");
    first.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn presence_handlers_fire_on_the_user_boundary() {
    let user_log: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let conn_log: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

    let server = Server::builder(ServerConfig::default())
        .context_provider(user_from_query)
        .on_user({
            let log = Arc::clone(&user_log);
            move |change| log.lock().unwrap().push(change.online)
        })
        .on_connection({
            let log = Arc::clone(&conn_log);
            move |change| log.lock().unwrap().push(change.online)
        })
        .build();
    let remote = TestServer::spawn(&server).await;
    let hub = server.hub();

    let mut first = remote.connect_with("&uid=5").await;
    first.expect_start().await;
    let mut second = remote.connect_with("&uid=5").await;
    second.expect_start().await;

    wait_for("both sessions counted", || {
        let hub = hub.clone();
        async move { hub.stats().await.presence.get(&5) == Some(&2) }
    })
    .await;

    second.close().await;
    wait_for("second session gone", || {
        let hub = hub.clone();
        async move { hub.stats().await.presence.get(&5) == Some(&1) }
    })
    .await;

    first.close().await;
    wait_for("presence entry deleted", || {
        let hub = hub.clone();
        async move { hub.stats().await.presence.is_empty() }
    })
    .await;

    // The user handler saw exactly the 0→1 and 1→0 transitions.
    assert_eq!(&*user_log.lock().unwrap(), &[true, false]);
    assert_eq!(&*conn_log.lock().unwrap(), &[true, false]);
}

#[tokio::test]
async fn teardown_unsubscribes_everywhere() {
    let server = Server::builder(ServerConfig::default()).build();
    let remote = TestServer::spawn(&server).await;
    let hub = server.hub();

    let mut socket = remote.connect().await;
    socket.expect_start().await;
    socket.subscribe("a").await;
    socket.subscribe("b").await;
    wait_for("subscriptions applied", || {
        let hub = hub.clone();
        async move { hub.stats().await.subscribers.len() == 2 }
    })
    .await;

    socket.close().await;
    wait_for("topics deleted with their last subscriber", || {
        let hub = hub.clone();
        async move { hub.stats().await.subscribers.is_empty() }
    })
    .await;
}

#[tokio::test]
async fn upgrade_is_gated_by_the_access_token() {
    let server = Server::builder(ServerConfig::default())
        .context_provider(|ctx, _parts| ctx.with(AccessToken("sec".into())))
        .build();
    let remote = TestServer::spawn(&server).await;

    let denied = TestSocket::try_connect(&remote.ws_url("")).await;
    assert!(denied.is_err(), "handshake should fail without the token");

    let mut socket = remote.connect_with("&token=sec").await;
    socket.expect_start().await;
}

#[tokio::test]
async fn disabled_websocket_rejects_upgrades_and_hides_the_flag() {
    let config = ServerConfig {
        websocket: false,
        ..ServerConfig::default()
    };
    let server = Server::builder(config).build();
    let app = TestApp::for_server(&server);

    let catalog = app.get("/").await;
    assert_eq!(
        catalog.json::<serde_json::Value>(),
        json!({"api": {}, "data": {}})
    );

    let rejected = app.get("/?ws=1").await;
    assert_eq!(rejected.status, 400);
}
