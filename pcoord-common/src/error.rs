use thiserror::Error;

/// Errors a [`crate::store::CheckpointStore`] implementation may report.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store connection failed: {0}")]
    Connection(String),
    #[error("checkpoint store operation failed: {0}")]
    Operation(String),
    /// The calling operation observed the run-scoped cancellation token.
    /// Never surfaced to a user error handler.
    #[error("cancelled")]
    Cancelled,
}

/// Errors a [`crate::transport::PartitionTransport`] implementation may
/// report.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("partition id discovery failed: {0}")]
    Discovery(String),
    #[error("receiver could not be opened for partition {partition_id}: {source}")]
    OpenReceiver {
        partition_id: String,
        source: String,
    },
    /// A transient failure reading from an already-open receiver. The pump
    /// reports this to `process_error` and restarts the receive loop from
    /// the last delivered position.
    #[error("transient receive error on partition {partition_id}: {source}")]
    Recoverable {
        partition_id: String,
        source: String,
    },
    /// An unrecoverable failure; the pump reports this to `process_error`
    /// and then self-closes with `CloseReason::PumpError`.
    #[error("fatal receive error on partition {partition_id}: {source}")]
    Fatal {
        partition_id: String,
        source: String,
    },
    /// The calling operation observed the run-scoped cancellation token.
    /// Never surfaced to a user error handler.
    #[error("cancelled")]
    Cancelled,
}

/// The taxonomy from which `process_error` contexts are built. Cancellation
/// is constructed internally and is never handed to user code.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("checkpoint store error: {0}")]
    Store(StoreError),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("cancelled")]
    Cancelled,
}

impl ProcessorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessorError::Cancelled)
    }
}

/// `StoreError::Cancelled` collapses into `ProcessorError::Cancelled`
/// rather than `ProcessorError::Store(..)` so a single `is_cancelled`
/// check at the loop level is enough to keep cancellation out of
/// `process_error`.
impl From<StoreError> for ProcessorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Cancelled => ProcessorError::Cancelled,
            other => ProcessorError::Store(other),
        }
    }
}

impl From<TransportError> for ProcessorError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Cancelled => ProcessorError::Cancelled,
            other => ProcessorError::Transport(other),
        }
    }
}
