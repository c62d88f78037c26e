//! Pending invoke requests keyed by request id.

use crate::command::InvokeResult;
use crate::error::Result;
use crate::promise::Promise;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Concurrent map from request id to the promise awaiting its response.
///
/// An entry leaves the table exactly once: through [`settle`](Self::settle)
/// when a response arrives, or through [`expire`](Self::expire) when its
/// timer fires. Whichever removes the entry resolves the promise; the other
/// finds nothing and does nothing.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<DashMap<String, Promise<InvokeResult>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending entry and arm its expiry timer.
    /// Must be called inside a tokio runtime.
    pub fn register(&self, request_id: &str, timeout: Duration) -> Promise<InvokeResult> {
        let promise = Promise::new();
        self.pending
            .insert(request_id.to_string(), promise.clone());

        let table = self.clone();
        let request_id = request_id.to_string();
        let settled = promise.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    if table.expire(&request_id) {
                        tracing::debug!(request_id = %request_id, "Invoke request expired");
                    }
                }
                _ = settled.wait() => {}
            }
        });
        promise
    }

    /// Resolve and remove the entry for `request_id`. Returns `false` when no
    /// entry exists (late, duplicate or already expired response).
    pub fn settle(&self, request_id: &str, result: Result<InvokeResult>) -> bool {
        let Some((_, promise)) = self.pending.remove(request_id) else {
            return false;
        };
        match result {
            Ok(value) => promise.fulfill(value),
            Err(error) => promise.fail(error),
        }
    }

    /// Remove the entry and cancel its promise. Returns `false` if it was
    /// already gone.
    pub fn expire(&self, request_id: &str) -> bool {
        self.pending
            .remove(request_id)
            .is_some_and(|(_, promise)| promise.cancel())
    }

    /// Cancel every pending entry; used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.expire(id)).count()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
