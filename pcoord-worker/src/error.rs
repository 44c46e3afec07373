use thiserror::Error;

/// Enumeration of errors that can prevent the demo worker from starting.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to bind metrics listener")]
    MetricsBindError(#[from] std::io::Error),
}
