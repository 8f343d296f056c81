//! Shared harness for bridge integration tests: a relay wired to a loopback
//! native host and an in-memory browser.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tweety::bridge::NativeBridge;
use tweety::bridge::config::BridgeConfig;
use tweety::bridge::fetch::ReqwestFetcher;
use tweety::bridge::memory_browser::MemoryBrowser;
use tweety::bridge::native_host::{HostEndpoint, LoopbackConnector};
use tweety::bridge::protocol::{INITIALIZE_METHOD, RpcResponse};
use tweety::bridge::relay::{MessageSender, Relay};
use tweety::bridge::router::Router;
use tweety::bridge::storage::LocalStorage;

pub const EXTENSION_ID: &str = "tweety";

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        extension_id: EXTENSION_ID.to_string(),
        connect_grace_ms: 10,
        handshake_timeout_ms: 2_000,
        call_timeout_ms: Some(5_000),
        command_timeout_ms: 2_000,
        ..BridgeConfig::default()
    }
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub bridge: Arc<NativeBridge>,
    pub browser: Arc<MemoryBrowser>,
    pub connector: Arc<LoopbackConnector>,
    pub endpoints: mpsc::UnboundedReceiver<HostEndpoint>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let (connector, endpoints) = LoopbackConnector::new();
        let connector = Arc::new(connector);
        let browser = Arc::new(MemoryBrowser::new());
        let router = Arc::new(Router::new(
            browser.clone(),
            Arc::new(ReqwestFetcher::new().expect("http client")),
        ));
        let bridge = Arc::new(NativeBridge::new(
            config,
            connector.clone(),
            router,
            Arc::new(LocalStorage::in_memory()),
        ));
        let relay = Arc::new(Relay::new(Arc::clone(&bridge), browser.clone()));
        Self {
            relay,
            bridge,
            browser,
            connector,
            endpoints,
        }
    }

    pub fn sender() -> MessageSender {
        MessageSender::extension(EXTENSION_ID)
    }

    /// Relays `payload` as this extension on a separate task.
    pub fn send(&self, payload: Value) -> JoinHandle<Option<Value>> {
        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move { relay.handle_message(&Self::sender(), payload).await })
    }

    /// Waits for the next connection and completes its handshake.
    pub async fn accept(&mut self) -> HostEndpoint {
        let mut endpoint = self.endpoints.recv().await.expect("connection attempt");
        let init = endpoint.recv_request().await.expect("initialize request");
        assert_eq!(init.method, INITIALIZE_METHOD);
        endpoint.respond(&RpcResponse::success(init.id.expect("id"), json!({})));
        endpoint
    }
}

pub fn request(id: &str, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}
