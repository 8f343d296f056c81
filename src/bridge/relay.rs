//! Relay between UI surfaces and the native host.
//!
//! Extension pages send JSON-RPC requests as internal messages. The relay
//! drops anything not sent by this extension, forwards well-formed requests
//! over the shared native connection and hands the correlated response back
//! to the caller. A host that cannot be reached yields a synthesized -32001
//! error instead of silence.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument as _;

use super::capabilities::{
    Browser, BrowserError, CreateTabProperties, CreateWindowData, NotificationOptions, OneOrMany,
};
use super::commands::CommandAction;
use super::config::BridgeConfig;
use super::pending::CallError;
use super::protocol::{self, HOST_NOT_CONNECTED_MESSAGE, RpcErrorObject, RpcRequest, RpcResponse};
use super::storage::generate_secure_id;
use super::{BridgeError, NativeBridge};
use crate::logging;

pub const RUN_COMMAND_METHOD: &str = "commands.run";
const COMMAND_ERROR_TITLE: &str = "Command Error";
const COMMAND_ERROR_ICON: &str = "icon/128.png";

/// Origin of an internal message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    /// Id of the sending extension; `None` for web pages.
    pub id: Option<String>,
    pub url: Option<String>,
    pub tab_id: Option<i64>,
}

impl MessageSender {
    #[must_use]
    pub fn extension(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// One message from a UI surface, with the handle its reply goes to.
#[derive(Debug)]
pub struct InternalMessage {
    pub sender: MessageSender,
    pub payload: Value,
    pub reply: oneshot::Sender<Value>,
}

impl InternalMessage {
    #[must_use]
    pub fn new(sender: MessageSender, payload: Value) -> (Self, oneshot::Receiver<Value>) {
        let (reply, receiver) = oneshot::channel();
        (
            Self {
                sender,
                payload,
                reply,
            },
            receiver,
        )
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    OpenedTab(i64),
    OpenedWindow(i64),
    Completed(Value),
    /// The host answered with an error; the user was notified.
    Failed {
        notification_id: String,
        message: String,
    },
}

pub struct Relay {
    extension_id: String,
    origin: String,
    terminal_page: String,
    call_timeout: Option<Duration>,
    command_timeout: Duration,
    bridge: Arc<NativeBridge>,
    browser: Arc<dyn Browser>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("extension_id", &self.extension_id)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl Relay {
    #[must_use]
    pub fn new(bridge: Arc<NativeBridge>, browser: Arc<dyn Browser>) -> Self {
        let config: &BridgeConfig = bridge.config();
        Self {
            extension_id: config.extension_id.clone(),
            origin: config.origin(),
            terminal_page: config.terminal_page.clone(),
            call_timeout: config.call_timeout(),
            command_timeout: config.command_timeout(),
            bridge,
            browser,
        }
    }

    #[must_use]
    pub const fn bridge(&self) -> &Arc<NativeBridge> {
        &self.bridge
    }

    /// Handles one internal message. `None` means no reply is sent.
    pub async fn handle_message(&self, sender: &MessageSender, payload: Value) -> Option<Value> {
        if sender.id.as_deref() != Some(self.extension_id.as_str()) {
            tracing::warn!(sender = ?sender.id, "ignoring message from unknown sender");
            return None;
        }
        if !protocol::is_request(&payload) {
            tracing::debug!("ignoring malformed relay payload");
            return None;
        }
        let id = payload.get("id").and_then(Value::as_str).map(str::to_string);
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let span = logging::request_span(id.as_deref().unwrap_or("-"), &method);

        async move {
            let link = match self.bridge.ensure_connected().await {
                Ok(link) => link,
                Err(err) => {
                    tracing::warn!("relay could not reach native host: {err}");
                    return Some(unavailable_response(id.as_deref(), HOST_NOT_CONNECTED_MESSAGE));
                }
            };

            let Some(id) = id else {
                if let Err(err) = link.post(payload) {
                    tracing::warn!("failed to forward notification: {err}");
                }
                return None;
            };

            match link.forward(&id, payload, self.call_timeout).await {
                Ok(response) => Some(response.to_value()),
                Err(err) => {
                    tracing::warn!("relayed call failed: {err}");
                    Some(failure_response(&id, &err))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Serves messages until every sender of `inbox` is gone. Each message
    /// runs on its own task; dropping a reply handle cancels that call.
    pub async fn serve(self: Arc<Self>, mut inbox: mpsc::Receiver<InternalMessage>) {
        while let Some(message) = inbox.recv().await {
            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                let InternalMessage {
                    sender,
                    payload,
                    mut reply,
                } = message;
                tokio::select! {
                    response = relay.handle_message(&sender, payload) => {
                        if let Some(response) = response {
                            if reply.send(response).is_err() {
                                tracing::debug!("caller went away before the reply");
                            }
                        }
                    }
                    () = reply.closed() => {
                        tracing::debug!("caller dropped its reply handle; cancelling relayed call");
                    }
                }
            });
        }
    }

    /// Runs a menu or keyboard command. `input` is the click context, if any.
    pub async fn run_command(
        &self,
        command_id: &str,
        input: Option<Value>,
    ) -> Result<CommandOutcome, CommandError> {
        let action = CommandAction::parse(command_id)
            .ok_or_else(|| CommandError::Unknown(command_id.to_string()))?;
        match action {
            CommandAction::OpenInNewTab => {
                let properties = CreateTabProperties {
                    url: Some(self.terminal_url()),
                    active: Some(true),
                    ..CreateTabProperties::default()
                };
                match self.browser.create_tab(properties).await {
                    Ok(tab) => Ok(CommandOutcome::OpenedTab(tab.id)),
                    Err(BrowserError::NoCurrentWindow) => self.open_terminal_window().await,
                    Err(err) => Err(err.into()),
                }
            }
            CommandAction::OpenInNewWindow => self.open_terminal_window().await,
            CommandAction::Run(command) => self.run_host_command(command, input).await,
        }
    }

    async fn open_terminal_window(&self) -> Result<CommandOutcome, CommandError> {
        let data = CreateWindowData {
            url: Some(OneOrMany::One(self.terminal_url())),
            focused: Some(true),
            ..CreateWindowData::default()
        };
        let window = self.browser.create_window(data).await?;
        Ok(CommandOutcome::OpenedWindow(window.id))
    }

    async fn run_host_command(
        &self,
        command: String,
        input: Option<Value>,
    ) -> Result<CommandOutcome, CommandError> {
        tracing::info!(%command, "running command");
        let mut params = Map::new();
        params.insert("command".to_string(), Value::String(command));
        if let Some(input) = input {
            params.insert("input".to_string(), input);
        }
        let request = RpcRequest::new(
            uuid::Uuid::new_v4().to_string(),
            RUN_COMMAND_METHOD,
            Value::Object(params),
        );

        let response = self
            .bridge
            .call(&request, Some(self.command_timeout))
            .await?;
        match response.into_result() {
            Ok(result) => Ok(CommandOutcome::Completed(result)),
            Err(error) => {
                let options = NotificationOptions {
                    kind: Some("basic".to_string()),
                    icon_url: Some(format!("{}{COMMAND_ERROR_ICON}", self.origin)),
                    title: COMMAND_ERROR_TITLE.to_string(),
                    message: error.message.clone(),
                    context_message: None,
                };
                let notification_id = self.browser.create_notification(None, options).await?;
                Ok(CommandOutcome::Failed {
                    notification_id,
                    message: error.message,
                })
            }
        }
    }

    fn terminal_url(&self) -> String {
        format!(
            "{}/{}",
            self.origin.trim_end_matches('/'),
            self.terminal_page.trim_start_matches('/')
        )
    }
}

/// -32001 response for a request that never reached the host. Requests
/// without an id get a fresh one so the reply is still well-formed.
#[must_use]
pub fn unavailable_response(id: Option<&str>, message: &str) -> Value {
    let id = id.map_or_else(|| generate_secure_id(12), str::to_string);
    RpcResponse::failure(id, RpcErrorObject::host_unavailable(message)).to_value()
}

fn failure_response(id: &str, err: &BridgeError) -> Value {
    match err {
        BridgeError::Call(CallError::TimedOut { .. }) => {
            unavailable_response(Some(id), "Native host did not respond in time")
        }
        BridgeError::Call(CallError::ConnectionLost) | BridgeError::NotConnected => {
            unavailable_response(Some(id), "Native host disconnected")
        }
        BridgeError::Call(CallError::DuplicateId { .. }) => RpcResponse::failure(
            id,
            RpcErrorObject::internal(format!("Request id {id} is already pending")),
        )
        .to_value(),
        BridgeError::Unsendable(err) => {
            RpcResponse::failure(id, RpcErrorObject::internal(err.to_string())).to_value()
        }
        _ => unavailable_response(Some(id), HOST_NOT_CONNECTED_MESSAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{HOST_UNAVAILABLE, INTERNAL_ERROR};
    use serde_json::json;

    #[test]
    fn unavailable_response_keeps_or_invents_id() {
        let response = unavailable_response(Some("r1"), HOST_NOT_CONNECTED_MESSAGE);
        assert_eq!(
            response,
            json!({
                "jsonrpc": "2.0",
                "id": "r1",
                "error": {"code": -32001, "message": "Native host is not connected"}
            })
        );

        let response = unavailable_response(None, HOST_NOT_CONNECTED_MESSAGE);
        let id = response["id"].as_str().expect("generated id");
        assert_eq!(id.len(), 12);
        assert!(protocol::is_response(&response));
    }

    #[test]
    fn call_failures_map_to_reserved_codes() {
        let timed_out = failure_response(
            "r2",
            &BridgeError::Call(CallError::TimedOut {
                id: "r2".to_string(),
            }),
        );
        assert_eq!(timed_out["error"]["code"], json!(HOST_UNAVAILABLE));
        assert_eq!(
            timed_out["error"]["message"],
            json!("Native host did not respond in time")
        );

        let lost = failure_response("r3", &BridgeError::Call(CallError::ConnectionLost));
        assert_eq!(lost["error"]["code"], json!(HOST_UNAVAILABLE));

        let duplicate = failure_response(
            "r4",
            &BridgeError::Call(CallError::DuplicateId {
                id: "r4".to_string(),
            }),
        );
        assert_eq!(duplicate["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(duplicate["id"], json!("r4"));

        let oversized = failure_response(
            "r5",
            &BridgeError::Unsendable(protocol::FrameCodecError::FrameTooLarge {
                frame_bytes: 70,
                max_bytes: 64,
            }),
        );
        assert_eq!(oversized["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(
            oversized["error"]["message"],
            json!("message not sent: native message exceeds 64 bytes (got 70)")
        );
    }

    #[test]
    fn message_sender_uses_extension_field_names() {
        let sender: MessageSender =
            serde_json::from_value(json!({"id": "tweety", "tabId": 7, "url": "chrome-extension://tweety/term.html"}))
                .expect("sender");
        assert_eq!(sender.tab_id, Some(7));
        assert_eq!(MessageSender::extension("tweety").id.as_deref(), Some("tweety"));
    }
}
