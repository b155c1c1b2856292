//! Outstanding request bookkeeping.
//!
//! Every registered id leaves the table exactly once: resolved by its
//! response, expired by its timeout, or cancelled. Whichever happens first
//! removes the entry under the lock; the others find nothing and do nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use openagents_gateway_proto::ResponseFrame;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CancelReason, CorrelationError, RequestError, TimeoutError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum Completion {
    Response(ResponseFrame),
    Cancelled(CancelReason),
}

#[derive(Debug)]
struct PendingRequest {
    issued_at: Instant,
    timeout_at: Instant,
    timeout: Duration,
    completion: oneshot::Sender<Completion>,
}

#[derive(Debug)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingRequest>>,
    default_timeout: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl CorrelationTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(self: &Arc<Self>, id: &str) -> Result<CompletionHandle, CorrelationError> {
        self.register_with_timeout(id, self.default_timeout)
    }

    pub fn register_with_timeout(
        self: &Arc<Self>,
        id: &str,
        timeout: Duration,
    ) -> Result<CompletionHandle, CorrelationError> {
        let mut pending = self.pending();
        if pending.contains_key(id) {
            return Err(CorrelationError::DuplicateId(id.to_string()));
        }
        let issued_at = Instant::now();
        let timeout_at = issued_at + timeout;
        let (completion, receiver) = oneshot::channel();
        pending.insert(
            id.to_string(),
            PendingRequest {
                issued_at,
                timeout_at,
                timeout,
                completion,
            },
        );
        Ok(CompletionHandle {
            id: id.to_string(),
            timeout_at,
            receiver,
            table: Arc::clone(self),
        })
    }

    /// Deliver a response. Returns the request latency, or `None` when the id
    /// is no longer pending (late response after timeout or cancel).
    pub fn resolve(&self, id: &str, response: ResponseFrame) -> Option<Duration> {
        let Some(entry) = self.pending().remove(id) else {
            debug!(%id, "discarding response without pending request");
            return None;
        };
        let latency = entry.issued_at.elapsed();
        if entry.completion.send(Completion::Response(response)).is_err() {
            debug!(%id, "response arrived after caller stopped waiting");
        }
        Some(latency)
    }

    pub fn expire(&self, id: &str) -> Option<TimeoutError> {
        let entry = self.pending().remove(id)?;
        debug!(%id, timeout_ms = entry.timeout.as_millis(), "request expired");
        Some(TimeoutError {
            id: id.to_string(),
            timeout: entry.timeout,
        })
    }

    pub fn cancel(&self, id: &str, reason: CancelReason) -> bool {
        let Some(entry) = self.pending().remove(id) else {
            return false;
        };
        let _ = entry.completion.send(Completion::Cancelled(reason));
        true
    }

    /// Cancel everything in flight. Returns how many requests were cancelled.
    pub fn cancel_all(&self, reason: &CancelReason) -> usize {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Completion::Cancelled(reason.clone()));
        }
        count
    }

    /// Ids whose deadline has passed, for callers that sweep instead of wait.
    pub fn overdue(&self, now: Instant) -> Vec<String> {
        self.pending()
            .iter()
            .filter(|(_, entry)| entry.timeout_at <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    fn forget(&self, id: &str) {
        self.pending().remove(id);
    }
}

/// Waits for one registered request to complete.
///
/// Dropping the handle before completion removes its table entry.
#[derive(Debug)]
pub struct CompletionHandle {
    id: String,
    timeout_at: Instant,
    receiver: oneshot::Receiver<Completion>,
    table: Arc<CorrelationTable>,
}

impl CompletionHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self) -> Result<ResponseFrame, RequestError> {
        let outcome = tokio::time::timeout_at(self.timeout_at, &mut self.receiver).await;
        let completion = match outcome {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Completion::Cancelled(CancelReason::Closed),
            Err(_elapsed) => match self.table.expire(&self.id) {
                Some(timeout) => return Err(RequestError::Timeout(timeout)),
                // Lost the race to resolve/cancel; the completion is already queued.
                None => match self.receiver.try_recv() {
                    Ok(completion) => completion,
                    Err(_) => Completion::Cancelled(CancelReason::Closed),
                },
            },
        };
        match completion {
            Completion::Response(response) => Ok(response),
            Completion::Cancelled(reason) => Err(RequestError::Cancelled {
                id: self.id.clone(),
                reason,
            }),
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.table.forget(&self.id);
    }
}
