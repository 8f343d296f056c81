//! Terminal session negotiation.
//!
//! A terminal page asks the host for a PTY with `tty.create` and receives a
//! WebSocket endpoint carrying the byte stream; resizes go out as
//! `tty.resize` notifications. [`TerminalClient`] speaks through the
//! [`Relay`] exactly like an extension page does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::protocol::{RpcErrorObject, RpcRequest, RpcResponse};
use super::relay::{MessageSender, Relay};

pub const CREATE_METHOD: &str = "tty.create";
pub const RESIZE_METHOD: &str = "tty.resize";
pub const XTERM_CONFIG_METHOD: &str = "xterm.getConfig";

/// What to run in the new PTY. Without a target the host starts the
/// user's default shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtyTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub app: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl TtyTarget {
    #[must_use]
    pub fn app(app: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            mode: Some("app".to_string()),
            app: app.into(),
            args,
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySession {
    pub id: String,
    pub url: String,
}

impl TtySession {
    /// Parsed stream endpoint; only `ws` and `wss` are accepted.
    pub fn endpoint(&self) -> Result<url::Url, TerminalError> {
        let invalid = |reason: String| TerminalError::InvalidEndpoint {
            url: self.url.clone(),
            reason,
        };
        let parsed = url::Url::parse(&self.url).map_err(|err| invalid(err.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(parsed),
            other => Err(invalid(format!("unsupported scheme {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtyResize<'a> {
    pub tty: &'a str,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XtermVariant {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("relay sent no response")]
    NoResponse,
    #[error("{0}")]
    Rpc(RpcErrorObject),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("invalid terminal endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct TerminalClient {
    relay: Arc<Relay>,
    sender: MessageSender,
}

impl TerminalClient {
    #[must_use]
    pub fn new(relay: Arc<Relay>) -> Self {
        let config = relay.bridge().config();
        let sender = MessageSender {
            id: Some(config.extension_id.clone()),
            url: Some(format!(
                "{}{}",
                config.origin().trim_end_matches('/'),
                config.terminal_page
            )),
            tab_id: None,
        };
        Self { relay, sender }
    }

    pub async fn xterm_config(&self, variant: XtermVariant) -> Result<Value, TerminalError> {
        self.request(XTERM_CONFIG_METHOD, Some(serde_json::json!({ "variant": variant })))
            .await
    }

    pub async fn create(&self, target: Option<&TtyTarget>) -> Result<TtySession, TerminalError> {
        let params = target
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| TerminalError::MalformedResponse(err.to_string()))?;
        let result = self.request(CREATE_METHOD, params).await?;
        let session: TtySession = serde_json::from_value(result)
            .map_err(|err| TerminalError::MalformedResponse(err.to_string()))?;
        session.endpoint()?;
        Ok(session)
    }

    /// Fire-and-forget; only a host that cannot be reached is reported.
    pub async fn resize(&self, resize: TtyResize<'_>) -> Result<(), TerminalError> {
        let params = serde_json::to_value(resize)
            .map_err(|err| TerminalError::MalformedResponse(err.to_string()))?;
        let payload = RpcRequest::notification(RESIZE_METHOD, params).to_value();
        match self.relay.handle_message(&self.sender, payload).await {
            None => Ok(()),
            Some(reply) => match RpcResponse::from_value(reply) {
                Some(response) => response.into_result().map(drop).map_err(TerminalError::Rpc),
                None => Err(TerminalError::MalformedResponse(
                    "unexpected reply to notification".to_string(),
                )),
            },
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TerminalError> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = RpcRequest {
            params,
            ..RpcRequest::new(id.as_str(), method, Value::Null)
        };
        let reply = self
            .relay
            .handle_message(&self.sender, request.to_value())
            .await
            .ok_or(TerminalError::NoResponse)?;
        let response = RpcResponse::from_value(reply)
            .ok_or_else(|| TerminalError::MalformedResponse(method.to_string()))?;
        if response.id != id {
            return Err(TerminalError::MalformedResponse(format!(
                "response id {} does not match request {id}",
                response.id
            )));
        }
        response.into_result().map_err(TerminalError::Rpc)
    }
}
