//! Per-partition receive pump: a single `tokio::task` bound to one
//! partition that delivers batches to the user processor in order and
//! restarts its receiver on a transient transport error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use pcoord_common::model::{CloseReason, EventPosition};
use pcoord_common::transport::{EventReceiver, PartitionContext, PartitionProcessor, PartitionTransport};

/// Runs a user-supplied callback, swallowing a panic rather than letting it
/// tear down the pump task. Per spec, the only user-observable failure path
/// is `process_error`; a panicking handler must not silently kill delivery
/// to the rest of the fleet.
async fn call_user<F>(callback: F, which: &str)
where
    F: Future<Output = ()>,
{
    if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
        tracing::error!(callback = which, "user handler panicked; swallowed");
    }
}

/// Run one partition's receive loop until cancelled or a fatal transport
/// error occurs. `close_reason` is read once cancellation is observed and
/// defaults to `Shutdown` if nothing set it (a pump that is cancelled
/// without `PumpManager::remove_all_pumps` routing a reason through is
/// always being shut down).
pub async fn run_pump<T>(
    transport: Arc<T>,
    processor: Arc<dyn PartitionProcessor>,
    context: PartitionContext,
    mut start_position: EventPosition,
    cancel: CancellationToken,
    close_reason: Arc<std::sync::Mutex<Option<CloseReason>>>,
) where
    T: PartitionTransport + 'static,
{
    call_user(processor.process_initialize(&context), "process_initialize").await;

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut receiver = match transport
            .open_receiver(&context.partition_id, start_position.clone())
            .await
        {
            Ok(receiver) => receiver,
            Err(error) => {
                let error_context = pcoord_common::transport::ErrorContext::for_partition_without_store(
                    context.fully_qualified_namespace.clone(),
                    context.event_hub_name.clone(),
                    context.consumer_group.clone(),
                    context.partition_id.clone(),
                );
                call_user(
                    processor.process_error(error.into(), &error_context),
                    "process_error",
                )
                .await;
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => continue 'reconnect,
                }
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'reconnect;
                }
                batch = receiver.receive_batch(cancel.clone()) => {
                    match batch {
                        Ok(events) => {
                            if let Some(last) = events.last() {
                                start_position = EventPosition::SequenceNumber(last.sequence_number);
                            }
                            call_user(processor.process_events(events, &context), "process_events").await;
                        }
                        Err(error @ pcoord_common::error::TransportError::Recoverable { .. }) => {
                            tracing::warn!(partition_id = %context.partition_id, "recoverable receive error, restarting receiver");
                            call_user(
                                processor.process_error(error.into(), &context.error_context()),
                                "process_error",
                            )
                            .await;
                            continue 'reconnect;
                        }
                        Err(error @ pcoord_common::error::TransportError::Fatal { .. } ) => {
                            tracing::error!(partition_id = %context.partition_id, "fatal receive error, closing pump");
                            call_user(
                                processor.process_error(error.into(), &context.error_context()),
                                "process_error",
                            )
                            .await;
                            let mut reason = close_reason.lock().expect("close reason mutex poisoned");
                            *reason = Some(CloseReason::PumpError);
                            break 'reconnect;
                        }
                        Err(pcoord_common::error::TransportError::Cancelled) => {
                            break 'reconnect;
                        }
                        Err(other) => {
                            tracing::warn!(partition_id = %context.partition_id, error = %other, "receive error, restarting receiver");
                            call_user(
                                processor.process_error(other.into(), &context.error_context()),
                                "process_error",
                            )
                            .await;
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }

    let reason = close_reason
        .lock()
        .expect("close reason mutex poisoned")
        .unwrap_or(CloseReason::Shutdown);
    call_user(processor.process_close(reason, &context), "process_close").await;
}
