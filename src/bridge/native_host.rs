//! Native messaging transport.
//!
//! A [`NativePort`] is the browser-side view of one native host connection:
//! an outgoing sender and an incoming receiver of JSON messages. The incoming
//! side closing is the disconnect signal. [`ProcessConnector`] launches the
//! real host; [`LoopbackConnector`] hands the host end to in-process code.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::config::HostCommand;
use super::protocol::{
    self, FrameCodecError, MAX_EXTENSION_MESSAGE_BYTES, MAX_HOST_MESSAGE_BYTES, RpcRequest,
    RpcResponse,
};

#[derive(Debug, Error)]
pub enum NativeHostError {
    #[error("failed to launch native host {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("native host process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("native host I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("native host frame codec error: {0}")]
    FrameCodec(#[from] FrameCodecError),
    #[error("invalid native messaging JSON payload: {0}")]
    NativeMessageJson(#[source] serde_json::Error),
    #[error("native messaging frame exceeds {max_bytes} bytes (got {frame_bytes})")]
    NativeMessageFrameTooLarge { frame_bytes: usize, max_bytes: usize },
    #[error("native host closed the channel")]
    Closed,
    #[error("no native host configured for {0}")]
    NotConfigured(String),
}

/// Browser-side ends of one native host connection.
#[derive(Debug)]
pub struct NativePort {
    pub outgoing: mpsc::UnboundedSender<Value>,
    pub incoming: mpsc::UnboundedReceiver<Value>,
}

#[async_trait]
pub trait NativeConnector: Send + Sync {
    /// Opens a port to `host_name`. A host that is not running shows up as a
    /// port whose incoming side closes right away, not as an error.
    async fn connect(&self, host_name: &str) -> Result<NativePort, NativeHostError>;
}

// ============================================================================
// Framed I/O
// ============================================================================

pub async fn read_native_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Value, NativeHostError> {
    let mut header = [0_u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        return Err(if err.kind() == io::ErrorKind::UnexpectedEof {
            NativeHostError::Closed
        } else {
            NativeHostError::Io(err)
        });
    }
    let frame_len = u32::from_le_bytes(header) as usize;
    if frame_len > max_bytes {
        return Err(NativeHostError::NativeMessageFrameTooLarge {
            frame_bytes: frame_len,
            max_bytes,
        });
    }

    let mut payload = vec![0_u8; frame_len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(NativeHostError::NativeMessageJson)
}

pub async fn write_native_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
    max_bytes: usize,
) -> Result<(), NativeHostError> {
    let frame = protocol::encode_frame(message, max_bytes)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Pumps framed JSON between a byte stream pair and a [`NativePort`].
///
/// Any failure to write, or EOF on `reader`, closes the port's incoming side,
/// which is the disconnect signal. A message too large to frame is dropped
/// without closing the port. `guard` is released once the port closes.
pub fn spawn_framed_port<R, W, G>(mut reader: R, mut writer: W, guard: G) -> NativePort
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    G: Send + 'static,
{
    let (outgoing, mut to_host) = mpsc::unbounded_channel::<Value>();
    let (from_host, incoming) = mpsc::unbounded_channel::<Value>();
    let (writer_alive, mut writer_stopped) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let _writer_alive = writer_alive;
        while let Some(message) = to_host.recv().await {
            match write_native_message(&mut writer, &message, MAX_EXTENSION_MESSAGE_BYTES).await {
                Ok(()) => {}
                Err(NativeHostError::FrameCodec(err)) => {
                    tracing::warn!("dropping message that cannot be framed: {err}");
                }
                Err(err) => {
                    tracing::warn!("native host write failed: {err}");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                read = read_native_message(&mut reader, MAX_HOST_MESSAGE_BYTES) => match read {
                    Ok(message) => {
                        if from_host.send(message).is_err() {
                            break;
                        }
                    }
                    Err(NativeHostError::Closed) => {
                        tracing::debug!("native host closed its output");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("native host read failed: {err}");
                        break;
                    }
                },
                _ = &mut writer_stopped => {
                    tracing::debug!("native host writer stopped; closing port");
                    break;
                }
                () = from_host.closed() => break,
            }
        }
    });

    NativePort { outgoing, incoming }
}

// ============================================================================
// Process connector
// ============================================================================

/// Launches `<program> [args..] chrome-extension://<id>/` and speaks framed
/// JSON over its stdio. The child is killed when the port is dropped.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    command: Option<HostCommand>,
    origin: String,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(command: Option<HostCommand>, origin: impl Into<String>) -> Self {
        Self {
            command,
            origin: origin.into(),
        }
    }
}

#[async_trait]
impl NativeConnector for ProcessConnector {
    async fn connect(&self, host_name: &str) -> Result<NativePort, NativeHostError> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| NativeHostError::NotConfigured(host_name.to_string()))?;
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .arg(&self.origin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NativeHostError::Spawn {
                program: command.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(NativeHostError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(NativeHostError::MissingPipe("stdout"))?;
        tracing::debug!(host = host_name, pid = ?child.id(), "launched native host");

        Ok(spawn_framed_port(stdout, stdin, child))
    }
}

// ============================================================================
// Loopback connector
// ============================================================================

/// Host side of a loopback connection.
#[derive(Debug)]
pub struct HostEndpoint {
    from_extension: mpsc::UnboundedReceiver<Value>,
    to_extension: mpsc::UnboundedSender<Value>,
}

impl HostEndpoint {
    pub async fn recv(&mut self) -> Option<Value> {
        self.from_extension.recv().await
    }

    /// Next well-formed request; other traffic is skipped.
    pub async fn recv_request(&mut self) -> Option<RpcRequest> {
        while let Some(message) = self.recv().await {
            if protocol::is_request(&message) {
                if let Ok(request) = serde_json::from_value(message) {
                    return Some(request);
                }
            }
        }
        None
    }

    pub fn send(&self, message: Value) -> bool {
        self.to_extension.send(message).is_ok()
    }

    pub fn respond(&self, response: &RpcResponse) -> bool {
        self.send(response.to_value())
    }

    /// Splits into a receiver and a cloneable sender.
    #[must_use]
    pub fn split(self) -> (mpsc::UnboundedReceiver<Value>, mpsc::UnboundedSender<Value>) {
        (self.from_extension, self.to_extension)
    }
}

/// Connector whose host side is delivered to the holder of the endpoint
/// receiver. Dropping a [`HostEndpoint`] disconnects that port.
#[derive(Debug)]
pub struct LoopbackConnector {
    endpoints: mpsc::UnboundedSender<HostEndpoint>,
    available: AtomicBool,
    attempts: AtomicUsize,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEndpoint>) {
        let (endpoints, receiver) = mpsc::unbounded_channel();
        (
            Self {
                endpoints,
                available: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
            },
            receiver,
        )
    }

    /// While unavailable, every port disconnects immediately.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeConnector for LoopbackConnector {
    async fn connect(&self, host_name: &str) -> Result<NativePort, NativeHostError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (outgoing, from_extension) = mpsc::unbounded_channel();
        let (to_extension, incoming) = mpsc::unbounded_channel();
        let endpoint = HostEndpoint {
            from_extension,
            to_extension,
        };
        if self.available.load(Ordering::SeqCst) {
            if self.endpoints.send(endpoint).is_err() {
                tracing::debug!(host = host_name, "loopback host is gone");
            }
        } else {
            tracing::debug!(host = host_name, "loopback host unavailable");
            drop(endpoint);
        }
        Ok(NativePort { outgoing, incoming })
    }
}
