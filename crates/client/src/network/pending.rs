//! Correlation of websocket responses to outstanding requests.
//!
//! Every request sent over the push channel registers a slot keyed by its
//! correlation id. The dispatch loop resolves the slot when a frame with the
//! same id arrives. Each slot is removed exactly once: by resolution, by the
//! caller's read timeout, by the caller dropping its handle, or by
//! [`PendingRequestTable::fail_all`] when the connection dies.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{ClientError, Result, TimeoutKind};

type Slot = oneshot::Sender<Result<Bytes>>;

/// Table of in-flight requests on one connection.
#[derive(Debug)]
pub struct PendingRequestTable {
    slots: DashMap<u32, Slot>,
    next_id: AtomicU32,
    read_timeout: Duration,
}

impl PendingRequestTable {
    /// Create a table whose ids start just above the current unix time.
    pub fn new(read_timeout: Duration) -> Arc<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self::with_seed(seed, read_timeout)
    }

    /// Create a table with an explicit id seed.
    pub fn with_seed(seed: u32, read_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            next_id: AtomicU32::new(seed),
            read_timeout,
        })
    }

    /// Allocate a fresh correlation id and register a slot for it.
    ///
    /// Ids wrap around `u32`; an id still outstanding after a wrap is skipped.
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Entry::Vacant(entry) = self.slots.entry(id) {
                if let Some(tx) = tx.take() {
                    entry.insert(tx);
                }
                return PendingRequest {
                    correlation_id: id,
                    rx: Some(rx),
                    table: Arc::clone(self),
                    read_timeout: self.read_timeout,
                };
            }
        }
    }

    /// Complete the request with `correlation_id`.
    ///
    /// Returns `false` if no such request is outstanding; late or unknown
    /// responses are not an error.
    pub fn resolve(&self, correlation_id: u32, data: Bytes) -> bool {
        match self.slots.remove(&correlation_id) {
            Some((_, slot)) => {
                // The waiter may already be gone; the slot is removed either way.
                let _ = slot.send(Ok(data));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with [`ClientError::ConnectionClosed`].
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<u32> = self.slots.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.send(Err(ClientError::ConnectionClosed(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(failed, reason, "Failed outstanding requests");
        }
        failed
    }

    /// Whether `correlation_id` is outstanding.
    pub fn contains(&self, correlation_id: u32) -> bool {
        self.slots.contains_key(&correlation_id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn remove(&self, correlation_id: u32) {
        self.slots.remove(&correlation_id);
    }
}

/// Caller-side handle for one in-flight request.
///
/// Dropping the handle before a response arrives removes the slot.
#[derive(Debug)]
pub struct PendingRequest {
    correlation_id: u32,
    rx: Option<oneshot::Receiver<Result<Bytes>>>,
    table: Arc<PendingRequestTable>,
    read_timeout: Duration,
}

impl PendingRequest {
    /// Correlation id carried by the request frame.
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// Wait for the response using the table's read timeout.
    pub async fn read(self) -> Result<Bytes> {
        let timeout = self.read_timeout;
        self.await_result(timeout).await
    }

    /// Wait for the response for at most `timeout`.
    ///
    /// On timeout the slot is removed and a later response for this id is
    /// ignored by the dispatch loop.
    pub async fn await_result(mut self, timeout: Duration) -> Result<Bytes> {
        let Some(rx) = self.rx.take() else {
            return Err(ClientError::ConnectionClosed(
                "response already taken".to_string(),
            ));
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed(
                "request slot dropped".to_string(),
            )),
            Err(_) => {
                tracing::debug!(
                    correlation_id = self.correlation_id,
                    "Timed out waiting for response"
                );
                Err(ClientError::Timeout(TimeoutKind::Read))
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(self.correlation_id);
    }
}
