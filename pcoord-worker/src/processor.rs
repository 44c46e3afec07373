//! A demo `PartitionProcessor`: logs each batch, checkpoints the last
//! event in it, and reports liveness on every delivery.

use std::sync::Arc;

use async_trait::async_trait;

use health::HealthHandle;
use pcoord_common::error::ProcessorError;
use pcoord_common::model::{CloseReason, ReceivedEvent};
use pcoord_common::transport::{ErrorContext, PartitionContext, PartitionProcessor};

pub struct LoggingProcessor {
    liveness: Arc<HealthHandle>,
}

impl LoggingProcessor {
    pub fn new(liveness: HealthHandle) -> Self {
        Self {
            liveness: Arc::new(liveness),
        }
    }
}

#[async_trait]
impl PartitionProcessor for LoggingProcessor {
    async fn process_initialize(&self, context: &PartitionContext) {
        tracing::info!(partition_id = %context.partition_id, "pump starting");
    }

    async fn process_events(&self, events: Vec<ReceivedEvent>, context: &PartitionContext) {
        tracing::info!(
            partition_id = %context.partition_id,
            count = events.len(),
            "received events"
        );
        self.liveness.report_healthy().await;

        if let Some(last) = events.last() {
            if let Err(error) = context.update_checkpoint(last).await {
                tracing::warn!(partition_id = %context.partition_id, %error, "failed to checkpoint");
            }
        }
    }

    async fn process_error(&self, error: ProcessorError, context: &ErrorContext) {
        tracing::warn!(partition_id = %context.partition_id, %error, "processor reported an error");
    }

    async fn process_close(&self, reason: CloseReason, context: &PartitionContext) {
        tracing::info!(partition_id = %context.partition_id, ?reason, "pump closed");
    }
}
