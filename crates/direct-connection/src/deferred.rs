//! Single-settlement values that any number of tasks can await.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::NegotiationError;

type Slot<T> = Option<Result<T, NegotiationError>>;

/// A value that is resolved or rejected exactly once. Later settlements are
/// refused and reported back to the caller; the first outcome is kept.
#[derive(Debug)]
pub struct Deferred<T: Clone> {
    slot: Arc<watch::Sender<Slot<T>>>,
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Returns `false` if the value was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Returns `false` if the value was already settled.
    pub fn reject(&self, error: NegotiationError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, NegotiationError>) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_pending(&self) -> bool {
        self.slot.borrow().is_none()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.slot.borrow(), Some(Ok(_)))
    }

    /// Current outcome without waiting.
    pub fn peek(&self) -> Option<Result<T, NegotiationError>> {
        self.slot.borrow().clone()
    }

    pub async fn wait(&self) -> Result<T, NegotiationError> {
        let mut rx = self.slot.subscribe();
        let settled = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| NegotiationError::new("connection dropped before settling"))?;
        match &*settled {
            Some(outcome) => outcome.clone(),
            None => Err(NegotiationError::new("connection dropped before settling")),
        }
    }
}

/// Waits for both values; the first rejection wins.
pub async fn join<A: Clone, B: Clone>(
    a: &Deferred<A>,
    b: &Deferred<B>,
) -> Result<(A, B), NegotiationError> {
    tokio::try_join!(a.wait(), b.wait())
}
