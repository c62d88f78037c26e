//! Single-assignment promise with listeners and optional deadline cancellation.

use crate::error::{CourierError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Failed,
    Cancelled,
}

/// Terminal outcome of a promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T> {
    Fulfilled(T),
    Failed(CourierError),
    Cancelled,
}

impl<T> Settlement<T> {
    pub fn state(&self) -> PromiseState {
        match self {
            Self::Fulfilled(_) => PromiseState::Fulfilled,
            Self::Failed(_) => PromiseState::Failed,
            Self::Cancelled => PromiseState::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Failed(error) => Err(error),
            Self::Cancelled => Err(CourierError::Cancelled),
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&Settlement<T>) + Send>;

struct Slot<T> {
    settlement: Option<Settlement<T>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    settled: watch::Sender<bool>,
}

/// Shared handle to a value that is set exactly once.
///
/// Clones observe the same state. The first of `fulfill`, `fail` or `cancel`
/// wins; later attempts return `false` and change nothing.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .inner
            .slot
            .lock()
            .settlement
            .as_ref()
            .map_or(PromiseState::Pending, Settlement::state);
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    settlement: None,
                    listeners: Vec::new(),
                }),
                settled,
            }),
        }
    }

    /// A promise that cancels itself if still pending after `timeout`.
    /// Must be called inside a tokio runtime.
    pub fn with_deadline(timeout: Duration) -> Self {
        let promise = Self::new();
        promise.cancel_after(timeout);
        promise
    }

    /// Schedule cancellation after `timeout`. The timer stops early once the
    /// promise settles.
    pub fn cancel_after(&self, timeout: Duration) {
        let promise = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    promise.cancel();
                }
                _ = promise.wait() => {}
            }
        });
    }

    pub fn state(&self) -> PromiseState {
        self.inner
            .slot
            .lock()
            .settlement
            .as_ref()
            .map_or(PromiseState::Pending, Settlement::state)
    }

    pub fn is_done(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    pub fn settlement(&self) -> Option<Settlement<T>> {
        self.inner.slot.lock().settlement.clone()
    }

    pub fn fulfill(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    pub fn fail(&self, error: CourierError) -> bool {
        self.settle(Settlement::Failed(error))
    }

    pub fn cancel(&self) -> bool {
        self.settle(Settlement::Cancelled)
    }

    fn settle(&self, settlement: Settlement<T>) -> bool {
        let listeners = {
            let mut slot = self.inner.slot.lock();
            if slot.settlement.is_some() {
                return false;
            }
            slot.settlement = Some(settlement.clone());
            std::mem::take(&mut slot.listeners)
        };
        self.inner.settled.send_replace(true);
        for listener in listeners {
            listener(&settlement);
        }
        true
    }

    /// Run `listener` once on settlement, or right away if already settled.
    pub fn on_settled(&self, listener: impl FnOnce(&Settlement<T>) + Send + 'static) {
        let settled = {
            let mut slot = self.inner.slot.lock();
            match &slot.settlement {
                Some(settlement) => settlement.clone(),
                None => {
                    slot.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&settled);
    }

    pub async fn wait(&self) -> Settlement<T> {
        let mut settled = self.inner.settled.subscribe();
        loop {
            if let Some(settlement) = self.settlement() {
                return settlement;
            }
            if settled.changed().await.is_err() {
                // The sender lives in `inner`, which `self` keeps alive.
                return Settlement::Cancelled;
            }
        }
    }

    /// Wait for the outcome. Cancellation surfaces as `CourierError::Cancelled`.
    pub async fn result(&self) -> Result<T> {
        self.wait().await.into_result()
    }
}
