//! Per-connection registry of calls awaiting a correlated response.
//!
//! Every entry is consumed exactly once: by its response, its deadline,
//! cancellation (the [`PendingCall`] is dropped), or [`PendingCalls::fail_all`]
//! when the connection goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use super::protocol::RpcResponse;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("native host connection lost")]
    ConnectionLost,
    #[error("call {id} timed out")]
    TimedOut { id: String },
    #[error("call {id} was cancelled")]
    Cancelled { id: String },
    #[error("call id {id} is already pending")]
    DuplicateId { id: String },
}

type CallResult = Result<RpcResponse, CallError>;

struct Entry {
    token: u64,
    sender: oneshot::Sender<CallResult>,
}

#[derive(Default)]
struct Registry {
    entries: StdMutex<HashMap<String, Entry>>,
    next_token: AtomicU64,
}

#[derive(Clone, Default)]
pub struct PendingCalls {
    registry: Arc<Registry>,
}

impl fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.len())
            .finish()
    }
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns the handle that waits for its response.
    ///
    /// Ids are unique among in-flight calls; a second registration of a live
    /// id fails with [`CallError::DuplicateId`] and leaves the first intact.
    pub fn register(
        &self,
        id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        let id = id.into();
        let token = self.registry.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        {
            let mut entries = self.lock();
            if entries.contains_key(&id) {
                return Err(CallError::DuplicateId { id });
            }
            entries.insert(id.clone(), Entry { token, sender });
        }
        Ok(PendingCall {
            id,
            token,
            timeout,
            receiver,
            calls: self.clone(),
        })
    }

    /// Completes the matching entry. Unknown ids are a no-op.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let entry = self.lock().remove(&response.id);
        match entry {
            Some(entry) => entry.sender.send(Ok(response)).is_ok(),
            None => {
                tracing::debug!(id = %response.id, "dropping response for unknown call id");
                false
            }
        }
    }

    /// Times out the entry for `id` immediately.
    pub fn expire(&self, id: &str) -> bool {
        let entry = self.lock().remove(id);
        entry.is_some_and(|entry| {
            entry
                .sender
                .send(Err(CallError::TimedOut { id: id.to_string() }))
                .is_ok()
        })
    }

    /// Fails every in-flight call with [`CallError::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(CallError::ConnectionLost));
        }
        if count > 0 {
            tracing::debug!(count, "failed pending calls after connection loss");
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_token(&self, id: &str, token: u64) {
        let mut entries = self.lock();
        if entries.get(id).is_some_and(|entry| entry.token == token) {
            entries.remove(id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.registry
            .entries
            .lock()
            .expect("pending calls mutex poisoned")
    }
}

/// Waiting side of a registered call. Dropping it cancels the call.
pub struct PendingCall {
    id: String,
    token: u64,
    timeout: Option<Duration>,
    receiver: oneshot::Receiver<CallResult>,
    calls: PendingCalls,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self) -> Result<RpcResponse, CallError> {
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.calls.remove_token(&self.id, self.token);
                    return Err(CallError::TimedOut {
                        id: self.id.clone(),
                    });
                }
            },
            None => (&mut self.receiver).await,
        };
        received.unwrap_or_else(|_| {
            Err(CallError::Cancelled {
                id: self.id.clone(),
            })
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.remove_token(&self.id, self.token);
    }
}
