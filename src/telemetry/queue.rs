//! Bounded handoff queue between the collection loop and its consumer.
//!
//! Built on `tokio::sync::mpsc`, so the receiving side may live on a plain OS
//! thread (`blocking_recv`, `try_recv`) while the producer runs on the
//! runtime. Intended for one producer loop and one consumer; several
//! consumers must share the receiver behind a mutex.
//!
//! Publishing never blocks: when the queue is full the *new* snapshot is
//! dropped and counted.

use super::snapshot::MetricsSnapshot;
use crate::log::{Logger, SharedLogger};
use crate::{log_debug, log_warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Create a queue holding at most `capacity` snapshots (minimum 1).
pub fn snapshot_queue(capacity: usize, logger: SharedLogger) -> (SnapshotSender, SnapshotReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        SnapshotSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            logger,
        },
        SnapshotReceiver { rx },
    )
}

#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<MetricsSnapshot>,
    dropped: Arc<AtomicU64>,
    logger: SharedLogger,
}

impl SnapshotSender {
    /// Enqueue without waiting. Returns false when the snapshot was dropped.
    pub fn publish(&self, snapshot: MetricsSnapshot) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => true,
            Err(TrySendError::Full(snapshot)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log_warn!(
                    self.logger,
                    "Snapshot queue full ({} queued), dropping snapshot #{} ({} dropped so far)",
                    self.capacity(),
                    snapshot.sequence,
                    dropped
                );
                false
            }
            Err(TrySendError::Closed(snapshot)) => {
                log_debug!(
                    self.logger,
                    "No consumer attached, discarding snapshot #{}",
                    snapshot.sequence
                );
                false
            }
        }
    }

    /// Snapshots currently waiting
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Snapshots dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct SnapshotReceiver {
    rx: mpsc::Receiver<MetricsSnapshot>,
}

impl SnapshotReceiver {
    /// Next snapshot if one is waiting.
    pub fn try_recv(&mut self) -> Option<MetricsSnapshot> {
        match self.rx.try_recv() {
            Ok(snapshot) => Some(snapshot),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the next snapshot; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<MetricsSnapshot> {
        self.rx.recv().await
    }

    /// Blocking variant for consumers on a plain thread.
    ///
    /// Panics if called from inside the async runtime.
    pub fn blocking_recv(&mut self) -> Option<MetricsSnapshot> {
        self.rx.blocking_recv()
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<MetricsSnapshot> {
        let mut out = Vec::with_capacity(self.rx.len());
        while let Some(snapshot) = self.try_recv() {
            out.push(snapshot);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
