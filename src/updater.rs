// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background queue decoupling write notifications from digest-store work.
//!
//! With non-blocking calls enabled, `h_put`/`h_remove` only enqueue here and
//! return; a single worker task drains the queue into synchronous engine
//! updates. The queue is bounded and lossless: producers wait when it is
//! full.
//!
//! The conditional ops exist for the full-rebuild scan. A scan result must
//! not clobber a fresher application write, so `PutIfAbsent` /
//! `RemoveIfAbsent` enqueue only while no other item for the same key is in
//! flight; the unconditional ops always enqueue. The in-flight set is shared
//! with the worker, which drops the key after handling it, success or
//! failure.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::engine::EngineCore;
use crate::error::HtError;
use crate::metrics;

/// One queued tree update.
#[derive(Debug)]
pub(crate) enum TreeOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    RemoveIfAbsent { key: Vec<u8> },
    /// Shutdown sentinel: the worker drains what is queued and exits.
    Stop,
}

impl TreeOp {
    fn key(&self) -> Option<&[u8]> {
        match self {
            TreeOp::Put { key, .. }
            | TreeOp::Remove { key }
            | TreeOp::PutIfAbsent { key, .. }
            | TreeOp::RemoveIfAbsent { key } => Some(key),
            TreeOp::Stop => None,
        }
    }

    fn is_conditional(&self) -> bool {
        matches!(
            self,
            TreeOp::PutIfAbsent { .. } | TreeOp::RemoveIfAbsent { .. }
        )
    }
}

/// Producer handle to the queue. Cheap to clone.
#[derive(Clone)]
pub(crate) struct NonBlockingUpdater {
    tx: mpsc::Sender<TreeOp>,
    in_flight: Arc<DashSet<Vec<u8>>>,
}

impl NonBlockingUpdater {
    /// Spawn the worker and return the producer handle plus a receiver that
    /// fires once the worker has drained and exited.
    pub(crate) fn spawn(
        core: Arc<EngineCore>,
        capacity: usize,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let in_flight = Arc::new(DashSet::new());
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_worker(core, rx, in_flight.clone(), done_tx));
        (Self { tx, in_flight }, done_rx)
    }

    /// Queue one update. Blocks while the queue is at capacity. Conditional
    /// ops are silently dropped when an item for the same key is already in
    /// flight.
    pub(crate) async fn enqueue(&self, op: TreeOp) -> Result<(), HtError> {
        let newly_queued = match op.key() {
            Some(key) => self.in_flight.insert(key.to_vec()),
            None => true,
        };
        if op.is_conditional() && !newly_queued {
            return Ok(());
        }
        self.tx.send(op).await.map_err(|_| HtError::Stopped)
    }

    pub(crate) async fn send_stop(&self) {
        let _ = self.tx.send(TreeOp::Stop).await;
    }
}

/// Removes a key from the in-flight set when the handler scope ends.
struct InFlightGuard<'a> {
    set: &'a DashSet<Vec<u8>>,
    key: Option<Vec<u8>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.set.remove(&key);
        }
    }
}

async fn run_worker(
    core: Arc<EngineCore>,
    mut rx: mpsc::Receiver<TreeOp>,
    in_flight: Arc<DashSet<Vec<u8>>>,
    done_tx: oneshot::Sender<()>,
) {
    debug!("non-blocking update worker started");
    while let Some(op) = rx.recv().await {
        if matches!(op, TreeOp::Stop) {
            // Flush whatever was queued behind the sentinel, then exit.
            while let Ok(remaining) = rx.try_recv() {
                if !matches!(remaining, TreeOp::Stop) {
                    handle_op(&core, &in_flight, remaining).await;
                }
            }
            break;
        }
        handle_op(&core, &in_flight, op).await;
    }
    debug!("non-blocking update worker exited");
    let _ = done_tx.send(());
}

async fn handle_op(core: &EngineCore, in_flight: &DashSet<Vec<u8>>, op: TreeOp) {
    let _guard = InFlightGuard {
        set: in_flight,
        key: op.key().map(<[u8]>::to_vec),
    };
    let result = match op {
        TreeOp::Put { key, value } | TreeOp::PutIfAbsent { key, value } => {
            core.apply_put(key, value).await
        }
        TreeOp::Remove { key } | TreeOp::RemoveIfAbsent { key } => core.apply_remove(key).await,
        TreeOp::Stop => return,
    };
    if let Err(error) = result {
        metrics::record_deferred_failure();
        warn!(%error, "deferred hash-tree update failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_keys() {
        let put = TreeOp::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(put.key(), Some(b"k".as_slice()));
        assert!(TreeOp::Stop.key().is_none());
        assert!(!put.is_conditional());
        assert!(TreeOp::RemoveIfAbsent { key: b"k".to_vec() }.is_conditional());
    }
}
