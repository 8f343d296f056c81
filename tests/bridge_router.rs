//! Host-initiated calls: loopback host → reader loop → router → in-memory
//! browser → correlated response on the same connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, request};
use serde_json::{Value, json};
use tweety::bridge::capabilities::Browser as _;
use tweety::bridge::native_host::HostEndpoint;
use tweety::bridge::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, RpcResponse};

async fn connect(harness: &mut Harness) -> HostEndpoint {
    let bridge = Arc::clone(&harness.bridge);
    let connecting = tokio::spawn(async move { bridge.ensure_connected().await });
    let host = harness.accept().await;
    connecting.await.expect("join").expect("connected");
    host
}

/// Sends `message` from the host and waits for the reply with `id`.
async fn host_call(host: &mut HostEndpoint, message: Value, id: &str) -> RpcResponse {
    assert!(host.send(message), "bridge side is open");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reply = host.recv().await.expect("bridge closed");
            if let Some(response) = RpcResponse::from_value(reply) {
                if response.id == id {
                    return response;
                }
            }
        }
    })
    .await
    .expect("reply in time")
}

#[tokio::test]
async fn host_creates_bookmark() {
    let mut harness = Harness::new();
    let mut host = connect(&mut harness).await;

    let response = host_call(
        &mut host,
        request(
            "h1",
            "bookmarks.create",
            json!([{"parentId": "1", "title": "Docs", "url": "https://docs.example/"}]),
        ),
        "h1",
    )
    .await;

    let created = response.result().expect("bookmark");
    assert_eq!(created["parentId"], json!("1"));
    assert_eq!(created["title"], json!("Docs"));
    assert_eq!(created["url"], json!("https://docs.example/"));
    let id = created["id"].as_str().expect("id").to_string();

    let tree = harness.browser.bookmark_tree().await.expect("tree");
    let bar = tree[0].children.as_ref().expect("root children")[0].clone();
    let children = bar.children.expect("bar children");
    assert!(children.iter().any(|node| node.id == id));
}

#[tokio::test]
async fn unknown_method_and_bad_params() {
    let mut harness = Harness::new();
    let mut host = connect(&mut harness).await;

    let response = host_call(&mut host, request("h2", "foo.bar", json!([])), "h2").await;
    let error = response.error().expect("error");
    assert_eq!(error.code, METHOD_NOT_FOUND);
    assert_eq!(error.message, "Method not found: foo.bar");

    let response = host_call(
        &mut host,
        request("h3", "tabs.query", json!({"active": true})),
        "h3",
    )
    .await;
    let error = response.error().expect("error");
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "Invalid params: expected an array");

    let response = host_call(&mut host, request("h4", "windows.get", json!([999])), "h4").await;
    assert_eq!(response.error().map(|e| e.code), Some(INTERNAL_ERROR));
}

#[tokio::test]
async fn tabs_get_without_params_uses_active_tab() {
    let mut harness = Harness::new();
    let mut host = connect(&mut harness).await;

    let response = host_call(&mut host, request("h5", "tabs.get", json!([])), "h5").await;
    let error = response.error().expect("no tabs yet");
    assert_eq!(error.code, INVALID_PARAMS);
    assert_eq!(error.message, "No active tab found");

    harness
        .browser
        .open_window(&["https://a.example/", "https://b.example/"]);
    let response = host_call(&mut host, request("h6", "tabs.get", json!([])), "h6").await;
    let tab = response.result().expect("active tab");
    assert_eq!(tab["url"], json!("https://a.example/"));
    assert_eq!(tab["active"], json!(true));
}

#[tokio::test]
async fn host_notifications_and_garbage_get_no_reply() {
    let mut harness = Harness::new();
    let mut host = connect(&mut harness).await;
    harness.browser.open_window(&["https://a.example/"]);

    assert!(host.send(json!({"hello": "world"})));
    assert!(host.send(json!({
        "jsonrpc": "2.0",
        "method": "tabs.create",
        "params": [{"url": "https://b.example/"}]
    })));
    assert!(host.send(json!({"jsonrpc": "2.0", "method": "nope.nothing", "params": []})));

    tokio::time::timeout(Duration::from_secs(2), async {
        while harness.browser.tab_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notification side effect applied");

    let response = host_call(&mut host, request("h7", "tabs.query", json!([{}])), "h7").await;
    let tabs = response.result().and_then(Value::as_array).expect("tabs");
    assert_eq!(tabs.len(), 2);

    // Nothing but the h7 reply was sent back.
    let extra = tokio::time::timeout(Duration::from_millis(50), host.recv()).await;
    assert!(extra.is_err(), "unexpected message: {extra:?}");
}

#[tokio::test]
async fn host_calls_run_alongside_relayed_calls() {
    let mut harness = Harness::new();
    let relayed = harness.send(request("r1", "tty.create", json!({})));
    let mut host = harness.accept().await;
    let pending = host.recv_request().await.expect("relayed request");

    // The host calls back into the browser before answering r1.
    let response = host_call(
        &mut host,
        request(
            "h8",
            "notifications.create",
            json!(["n1", {"type": "basic", "title": "Ready", "message": "Terminal ready"}]),
        ),
        "h8",
    )
    .await;
    assert_eq!(response.result(), Some(&json!({"notificationId": "n1"})));

    host.respond(&RpcResponse::success(
        pending.id.expect("id"),
        json!({"id": "t1", "url": "ws://127.0.0.1:9999/t1"}),
    ));
    let reply = relayed.await.expect("join").expect("reply");
    assert_eq!(reply["result"]["id"], json!("t1"));
    assert_eq!(harness.browser.notifications()[0].0, "n1");
}

#[tokio::test]
async fn commands_update_from_host_rebuilds_menus() {
    let mut harness = Harness::new();
    let mut host = connect(&mut harness).await;

    let response = host_call(
        &mut host,
        request(
            "h9",
            "commands.update",
            json!([[
                {"id": "summarize", "meta": {"title": "Summarize", "contexts": ["selection"]}},
                {"id": "archive", "meta": {"title": "Archive", "contexts": ["page"],
                    "documentUrlPatterns": ["https://*/*"]}}
            ]]),
        ),
        "h9",
    )
    .await;
    assert_eq!(response.result(), Some(&json!({})));

    let menus = harness.browser.context_menus();
    let ids: Vec<&str> = menus.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(
        ids,
        [
            "openInNewTab",
            "openInNewWindow",
            "runCommand",
            "commands:summarize",
            "commands:archive"
        ]
    );
    assert_eq!(
        menus[4].document_url_patterns.as_deref(),
        Some(&["https://*/*".to_string()][..])
    );
}
