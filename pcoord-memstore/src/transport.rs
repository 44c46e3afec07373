//! A deterministic in-memory transport: each partition yields a fixed
//! number of events, one per `receive_batch` call, then idles until
//! cancelled. Good enough to exercise the supervisor end-to-end without a
//! real event-hub connection.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pcoord_common::error::TransportError;
use pcoord_common::model::{EventPosition, ReceivedEvent};
use pcoord_common::transport::{EventReceiver, PartitionTransport};

pub struct FakeTransport {
    fully_qualified_namespace: String,
    event_hub_name: String,
    partition_ids: Vec<String>,
    events_per_partition: i64,
}

impl FakeTransport {
    pub fn new(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        partition_ids: Vec<String>,
        events_per_partition: i64,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_owned(),
            event_hub_name: event_hub_name.to_owned(),
            partition_ids,
            events_per_partition,
        }
    }
}

pub struct FakeReceiver {
    next_sequence_number: AtomicI64,
    remaining: AtomicI64,
}

#[async_trait]
impl PartitionTransport for FakeTransport {
    type Receiver = FakeReceiver;

    fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    async fn get_partition_ids(
        &self,
        _cancellation: CancellationToken,
    ) -> Result<Vec<String>, TransportError> {
        Ok(self.partition_ids.clone())
    }

    async fn open_receiver(
        &self,
        _partition_id: &str,
        start_position: EventPosition,
    ) -> Result<Self::Receiver, TransportError> {
        let start_sequence_number = match start_position {
            EventPosition::SequenceNumber(n) => n + 1,
            EventPosition::Offset(offset) => offset.parse::<i64>().unwrap_or(0) + 1,
            _ => 0,
        };
        Ok(FakeReceiver {
            next_sequence_number: AtomicI64::new(start_sequence_number),
            remaining: AtomicI64::new(self.events_per_partition),
        })
    }
}

#[async_trait]
impl EventReceiver for FakeReceiver {
    async fn receive_batch(
        &mut self,
        cancellation: CancellationToken,
    ) -> Result<Vec<ReceivedEvent>, TransportError> {
        if self.remaining.load(Ordering::SeqCst) <= 0 {
            tokio::select! {
                _ = cancellation.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(20)) => return Ok(Vec::new()),
            }
        }

        self.remaining.fetch_sub(1, Ordering::SeqCst);
        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ReceivedEvent {
            offset: sequence_number.to_string(),
            sequence_number,
        }])
    }
}
