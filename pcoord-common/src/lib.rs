//! Shared contracts for the partition-ownership coordinator: the
//! coordination/progress data model, the checkpoint store and transport
//! traits external collaborators implement, and the error taxonomy the
//! supervisor reports through.

pub mod error;
pub mod metrics;
pub mod model;
pub mod store;
pub mod transport;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
