use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::exchange::error::ExchangeError;

type PendingSet = HashSet<(String, u64)>;

/// Set of (symbol, order id) pairs some execution flow is currently
/// waiting on. The reconciler re-fetches exactly these orders via REST
/// after a stream reconnect, so an order id must be registered here
/// before any stream event for it could be dropped.
#[derive(Clone, Default)]
pub struct PendingOrders {
    inner: Arc<Mutex<PendingSet>>,
}

impl PendingOrders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the set's mutex and hold it. Nothing else can observe or
    /// mutate the pending set until the returned guard enters or is
    /// dropped, which closes the race between order placement and the
    /// stream seeing the new order id.
    pub async fn acquire(&self) -> OrderGuard {
        let slot = self.inner.clone().lock_owned().await;
        OrderGuard {
            inner: self.inner.clone(),
            slot: Some(slot),
            tag: None,
        }
    }

    /// Point-in-time copy, taken under the mutex. Resync requests may take
    /// arbitrarily long and must not hold the lock for their duration.
    pub async fn snapshot(&self) -> Vec<(String, u64)> {
        self.inner.lock().await.iter().cloned().collect()
    }

    pub async fn contains(&self, symbol: &str, order_id: u64) -> bool {
        self.inner
            .lock()
            .await
            .contains(&(symbol.to_string(), order_id))
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Single-use coordinator for one order-placement attempt.
///
/// Construction (via [`PendingOrders::acquire`]) takes the pending-set
/// mutex and keeps it; [`OrderGuard::enter`] inserts the attached
/// (symbol, id) pair and releases the mutex. Dropping an unentered guard
/// releases the mutex without registering anything.
pub struct OrderGuard {
    inner: Arc<Mutex<PendingSet>>,
    slot: Option<OwnedMutexGuard<PendingSet>>,
    tag: Option<(String, u64)>,
}

impl OrderGuard {
    /// Attach the order identity. Must be called before `enter`.
    pub fn set_order(&mut self, symbol: &str, order_id: u64) {
        self.tag = Some((symbol.to_string(), order_id));
    }

    /// Register the attached pair in the pending set and release the
    /// mutex. Entering without an attached id is a usage violation.
    pub fn enter(mut self) -> Result<ActiveOrder, ExchangeError> {
        let tag = self.tag.take().ok_or(ExchangeError::GuardNotSet)?;
        // Consuming self makes the guard single-use; slot is always present.
        let mut slot = self.slot.take().unwrap();
        slot.insert(tag.clone());
        drop(slot);

        Ok(ActiveOrder {
            inner: self.inner.clone(),
            tag,
        })
    }
}

/// Token proving a (symbol, id) pair is registered in the pending set.
/// The waiting flow must call [`ActiveOrder::release`] when it concludes,
/// on every exit path; the pair is removed exactly once.
#[must_use = "the pending-set entry leaks unless release() is called"]
#[derive(Debug)]
pub struct ActiveOrder {
    inner: Arc<Mutex<PendingSet>>,
    tag: (String, u64),
}

impl ActiveOrder {
    pub fn order_id(&self) -> u64 {
        self.tag.1
    }

    pub fn symbol(&self) -> &str {
        &self.tag.0
    }

    /// Remove the pair from the pending set.
    pub async fn release(self) {
        self.inner.lock().await.remove(&self.tag);
    }
}
