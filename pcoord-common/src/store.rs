use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Checkpoint, PartitionOwnership};

/// The durable ownership + checkpoint substrate every processor instance in
/// a fleet coordinates through. Any implementation satisfying these laws is
/// accepted; the core never references a concrete implementation.
///
/// - `list_ownership` returns all rows for the composite prefix; never
///   `None`, possibly empty.
/// - `claim_ownership` attempts each row using its `etag` as a
///   compare-and-swap precondition and returns exactly the rows that were
///   successfully written, each carrying a fresh `etag` and
///   `last_modified_time_ms`. Partial success is expected: a stale-etag row
///   is silently omitted from the result rather than failing the whole
///   batch.
/// - `update_checkpoint` upserts. Ordering across calls for the same
///   partition is the caller's (the pump's) responsibility, not the
///   store's.
/// - `list_checkpoints` returns all checkpoints for the composite prefix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, StoreError>;

    async fn claim_ownership(
        &self,
        requests: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, StoreError>;

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>, StoreError>;
}
