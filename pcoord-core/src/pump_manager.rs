//! Tracks the set of currently-running per-partition pumps and enforces
//! invariant P1: at most one pump task per partition at any time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pcoord_common::model::CloseReason;
use pcoord_common::transport::{PartitionContext, PartitionProcessor, PartitionTransport};

use crate::pump::run_pump;

struct PumpHandle {
    cancel: CancellationToken,
    close_reason: Arc<std::sync::Mutex<Option<CloseReason>>>,
    join: JoinHandle<()>,
}

/// Owns the live pump tasks, keyed by partition id. All mutation goes
/// through the inner `Mutex` so `create_pump`/`remove_all_pumps` calls
/// racing with the balance loop's own checks never leave two pumps
/// running for one partition.
#[derive(Default)]
pub struct PumpManager {
    pumps: Mutex<HashMap<String, PumpHandle>>,
}

impl PumpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a pump for `partition_id` unless one is already running.
    /// Idempotent: a second call for a partition already owned by a live
    /// pump is a no-op, matching P1.
    pub async fn create_pump<T>(
        &self,
        transport: Arc<T>,
        processor: Arc<dyn PartitionProcessor>,
        context: PartitionContext,
        start_position: pcoord_common::model::EventPosition,
        parent_cancel: &CancellationToken,
    ) where
        T: PartitionTransport + 'static,
    {
        let partition_id = context.partition_id.clone();
        let mut pumps = self.pumps.lock().await;
        if let Some(existing) = pumps.get(&partition_id) {
            if !existing.join.is_finished() {
                return;
            }
        }

        let cancel = parent_cancel.child_token();
        let close_reason = Arc::new(std::sync::Mutex::new(None));
        let join = tokio::spawn(run_pump(
            transport,
            processor,
            context,
            start_position,
            cancel.clone(),
            close_reason.clone(),
        ));

        pumps.insert(
            partition_id,
            PumpHandle {
                cancel,
                close_reason,
                join,
            },
        );
    }

    /// Reports whether a live, non-finished pump currently owns
    /// `partition_id`, cleaning up finished entries as a side effect.
    pub async fn is_receiving_from_partition(&self, partition_id: &str) -> bool {
        let mut pumps = self.pumps.lock().await;
        if let Some(handle) = pumps.get(partition_id) {
            if handle.join.is_finished() {
                pumps.remove(partition_id);
                return false;
            }
            return true;
        }
        false
    }

    /// Cancels every live pump with `reason` and waits for each to finish
    /// its final `process_close` call before returning, so that `stop()`
    /// never races an in-flight `process_events`/`process_close`.
    pub async fn remove_all_pumps(&self, reason: CloseReason) {
        let handles: Vec<PumpHandle> = {
            let mut pumps = self.pumps.lock().await;
            pumps.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            {
                let mut cell = handle.close_reason.lock().expect("close reason mutex poisoned");
                *cell = Some(reason);
            }
            handle.cancel.cancel();
            if let Err(error) = handle.join.await {
                tracing::warn!(%error, "pump task panicked while shutting down");
            }
        }
    }
}
