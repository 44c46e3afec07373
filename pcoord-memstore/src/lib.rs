//! Concrete, in-process reference implementations of the coordinator's
//! external interfaces: a `CheckpointStore` and a `PartitionTransport`.
//! Used by `pcoord-worker`'s demo binary and by `pcoord-core`'s
//! integration tests; neither is part of the coordination contract
//! itself.

mod store;
mod transport;

pub use store::InMemoryCheckpointStore;
pub use transport::{FakeReceiver, FakeTransport};
