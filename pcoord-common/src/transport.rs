use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessorError, StoreError, TransportError};
use crate::model::{Checkpoint, CloseReason, EventPosition, ReceivedEvent};
use crate::store::CheckpointStore;

/// The event-hub side of the contract: partition discovery and receiver
/// construction. Opening receivers, authentication, and retrying
/// transport-internal failures are all the implementation's concern; the
/// core only needs partition ids and a stream of batches.
#[async_trait]
pub trait PartitionTransport: Send + Sync {
    type Receiver: EventReceiver + Send;

    fn fully_qualified_namespace(&self) -> &str;
    fn event_hub_name(&self) -> &str;

    async fn get_partition_ids(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Vec<String>, TransportError>;

    async fn open_receiver(
        &self,
        partition_id: &str,
        start_position: EventPosition,
    ) -> Result<Self::Receiver, TransportError>;
}

/// A handle bound to one partition, yielding batches until closed or
/// cancelled.
#[async_trait]
pub trait EventReceiver: Send {
    async fn receive_batch(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<Vec<ReceivedEvent>, TransportError>;
}

/// Passed to `process_events`/`process_initialize`/`process_close`. Carries
/// enough identity for the user's `update_checkpoint` calls to be forwarded
/// to the store without the user ever touching it directly.
pub struct PartitionContext {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    store: Arc<dyn CheckpointStore>,
}

impl PartitionContext {
    pub fn new(
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
        partition_id: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            fully_qualified_namespace,
            event_hub_name,
            consumer_group,
            partition_id,
            store,
        }
    }

    /// Forward a user-driven checkpoint to the store. The core never
    /// verifies the caller still owns the partition (invariant C2): that
    /// is left to the store, or to the inactivity timer catching up later.
    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<(), StoreError> {
        self.store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: self.fully_qualified_namespace.clone(),
                event_hub_name: self.event_hub_name.clone(),
                consumer_group: self.consumer_group.clone(),
                partition_id: self.partition_id.clone(),
                offset: Some(event.offset.clone()),
                sequence_number: Some(event.sequence_number),
            })
            .await
    }

    /// An `ErrorContext` scoped to this partition, sharing the same store
    /// handle so `process_error`'s `update_checkpoint` behaves identically
    /// to `process_events`'s.
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::for_partition(
            self.fully_qualified_namespace.clone(),
            self.event_hub_name.clone(),
            self.consumer_group.clone(),
            self.partition_id.clone(),
            Arc::clone(&self.store),
        )
    }
}

/// Passed to `process_error`. A coordination error (empty `partition_id`)
/// carries a no-op `update_checkpoint`, matching spec: the error wasn't
/// scoped to any one partition so there is nothing sensible to checkpoint.
pub struct ErrorContext {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl ErrorContext {
    pub fn coordination(
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
    ) -> Self {
        Self {
            fully_qualified_namespace,
            event_hub_name,
            consumer_group,
            partition_id: String::new(),
            store: None,
        }
    }

    pub fn for_partition(
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
        partition_id: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            fully_qualified_namespace,
            event_hub_name,
            consumer_group,
            partition_id,
            store: Some(store),
        }
    }

    /// Like `for_partition`, but for an error observed before a receiver
    /// (and thus any checkpointable progress) exists for the partition;
    /// `update_checkpoint` is a no-op regardless of what is passed to it.
    pub fn for_partition_without_store(
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
        partition_id: String,
    ) -> Self {
        Self {
            fully_qualified_namespace,
            event_hub_name,
            consumer_group,
            partition_id,
            store: None,
        }
    }

    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<(), StoreError> {
        let (Some(store), false) = (&self.store, self.partition_id.is_empty()) else {
            return Ok(());
        };
        store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: self.fully_qualified_namespace.clone(),
                event_hub_name: self.event_hub_name.clone(),
                consumer_group: self.consumer_group.clone(),
                partition_id: self.partition_id.clone(),
                offset: Some(event.offset.clone()),
                sequence_number: Some(event.sequence_number),
            })
            .await
    }
}

/// User-supplied handlers, invoked by a pump in strict per-partition order:
/// the next batch is never delivered until `process_events` returns.
#[async_trait]
pub trait PartitionProcessor: Send + Sync {
    async fn process_initialize(&self, _context: &PartitionContext) {}

    async fn process_events(&self, events: Vec<ReceivedEvent>, context: &PartitionContext);

    async fn process_error(&self, error: ProcessorError, context: &ErrorContext);

    async fn process_close(&self, reason: CloseReason, context: &PartitionContext);
}
