//! A reference `CheckpointStore`, good enough for tests and the demo
//! worker binary: a `HashMap` guarded by a `std::sync::Mutex`, with
//! `etag` standing in for the durable store's CAS token the way
//! `hook_common::pgqueue`'s `FOR UPDATE SKIP LOCKED` claim stands in for a
//! real queue's locking.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use pcoord_common::error::StoreError;
use pcoord_common::model::{Checkpoint, PartitionOwnership};
use pcoord_common::store::CheckpointStore;

type OwnershipKey = (String, String, String, String);

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    ownerships: Mutex<HashMap<OwnershipKey, PartitionOwnership>>,
    checkpoints: Mutex<HashMap<OwnershipKey, Checkpoint>>,
}

fn ownership_key(o: &PartitionOwnership) -> OwnershipKey {
    (
        o.fully_qualified_namespace.clone(),
        o.event_hub_name.clone(),
        o.consumer_group.clone(),
        o.partition_id.clone(),
    )
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        let ownerships = self.ownerships.lock().expect("ownership mutex poisoned");
        Ok(ownerships
            .values()
            .filter(|o| {
                o.fully_qualified_namespace == fully_qualified_namespace
                    && o.event_hub_name == event_hub_name
                    && o.consumer_group == consumer_group
            })
            .cloned()
            .collect())
    }

    /// Applies each request's etag as a CAS precondition against the
    /// current row: `None` succeeds only if no row exists yet; `Some`
    /// succeeds only if it matches the current row's etag exactly. Rows
    /// that fail are omitted from the result rather than failing the call.
    async fn claim_ownership(
        &self,
        requests: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        let mut ownerships = self.ownerships.lock().expect("ownership mutex poisoned");
        let mut claimed = Vec::new();

        for mut request in requests {
            let key = ownership_key(&request);
            let matches = match ownerships.get(&key) {
                Some(current) => request.etag.is_some() && request.etag == current.etag,
                None => request.etag.is_none(),
            };
            if !matches {
                continue;
            }

            request.last_modified_time_ms = pcoord_common::now_ms();
            request.etag = Some(uuid::Uuid::new_v4().to_string());
            ownerships.insert(key, request.clone());
            claimed.push(request);
        }

        Ok(claimed)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let key = (
            checkpoint.fully_qualified_namespace.clone(),
            checkpoint.event_hub_name.clone(),
            checkpoint.consumer_group.clone(),
            checkpoint.partition_id.clone(),
        );
        let mut checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
        checkpoints.insert(key, checkpoint);
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint mutex poisoned");
        Ok(checkpoints
            .values()
            .filter(|c| {
                c.fully_qualified_namespace == fully_qualified_namespace
                    && c.event_hub_name == event_hub_name
                    && c.consumer_group == consumer_group
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(owner: &str, partition: &str, etag: Option<&str>) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: "ns".to_owned(),
            event_hub_name: "hub".to_owned(),
            consumer_group: "group".to_owned(),
            partition_id: partition.to_owned(),
            owner_id: owner.to_owned(),
            last_modified_time_ms: 0,
            etag: etag.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn first_claim_with_no_etag_succeeds() {
        let store = InMemoryCheckpointStore::new();
        let claimed = store
            .claim_ownership(vec![request("a", "0", None)])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].etag.is_some());
    }

    #[tokio::test]
    async fn second_claim_with_stale_etag_is_dropped() {
        let store = InMemoryCheckpointStore::new();
        store
            .claim_ownership(vec![request("a", "0", None)])
            .await
            .unwrap();

        let stale = store
            .claim_ownership(vec![request("b", "0", Some("wrong-etag"))])
            .await
            .unwrap();
        assert!(stale.is_empty());

        let ownerships = store.list_ownership("ns", "hub", "group").await.unwrap();
        assert_eq!(ownerships[0].owner_id, "a");
    }

    #[tokio::test]
    async fn claim_with_current_etag_succeeds_and_refreshes_etag() {
        let store = InMemoryCheckpointStore::new();
        let first = store
            .claim_ownership(vec![request("a", "0", None)])
            .await
            .unwrap();
        let current_etag = first[0].etag.clone();

        let mut retry = request("a", "0", current_etag.as_deref());
        retry.owner_id = "a".to_owned();
        let second = store.claim_ownership(vec![retry]).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].etag, current_etag);
    }

    #[tokio::test]
    async fn checkpoints_are_scoped_and_upserted() {
        let store = InMemoryCheckpointStore::new();
        store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: "ns".to_owned(),
                event_hub_name: "hub".to_owned(),
                consumer_group: "group".to_owned(),
                partition_id: "0".to_owned(),
                offset: None,
                sequence_number: Some(10),
            })
            .await
            .unwrap();
        store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: "ns".to_owned(),
                event_hub_name: "hub".to_owned(),
                consumer_group: "group".to_owned(),
                partition_id: "0".to_owned(),
                offset: None,
                sequence_number: Some(20),
            })
            .await
            .unwrap();

        let checkpoints = store.list_checkpoints("ns", "hub", "group").await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].sequence_number, Some(20));
    }
}
