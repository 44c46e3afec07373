//! The Event Processor: the supervisor a user constructs and calls
//! `start`/`stop` on. Owns the balance loop (or single-partition loop) and
//! delegates per-partition work to the [`crate::pump_manager::PumpManager`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pcoord_common::error::ProcessorError;
use pcoord_common::model::{CloseReason, EventPosition, PartitionOwnership, UserStart};
use pcoord_common::store::CheckpointStore;
use pcoord_common::transport::{ErrorContext, PartitionContext, PartitionProcessor, PartitionTransport};

use crate::balancer::{BalanceContext, LoadBalancer};
use crate::pump_manager::PumpManager;

/// What partitions this instance is responsible for: a single fixed
/// partition (bypassing the balancer entirely) or the full fleet,
/// negotiated through a [`LoadBalancer`].
pub enum Target {
    Fixed(String),
    Balanced(Arc<dyn LoadBalancer>),
}

struct RunState {
    cancel: CancellationToken,
    loop_handle: JoinHandle<()>,
}

/// A single processor instance: one owner id, bound to one consumer group
/// on one event hub, consuming either a fixed partition or a
/// balancer-negotiated share of the hub's partitions.
pub struct EventProcessor<T: PartitionTransport> {
    id: String,
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    transport: Arc<T>,
    store: Arc<dyn CheckpointStore>,
    processor: Arc<dyn PartitionProcessor>,
    target: Target,
    user_start: UserStart,
    loop_interval: Duration,
    inactive_time_limit_ms: i64,
    pump_manager: Arc<PumpManager>,
    running: AtomicBool,
    run_state: Mutex<Option<RunState>>,
}

impl<T> EventProcessor<T>
where
    T: PartitionTransport + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        consumer_group: String,
        transport: Arc<T>,
        store: Arc<dyn CheckpointStore>,
        processor: Arc<dyn PartitionProcessor>,
        target: Target,
        user_start: UserStart,
        loop_interval: Duration,
        inactive_time_limit_ms: i64,
    ) -> Self {
        let fully_qualified_namespace = transport.fully_qualified_namespace().to_owned();
        let event_hub_name = transport.event_hub_name().to_owned();
        Self {
            id,
            fully_qualified_namespace,
            event_hub_name,
            consumer_group,
            transport,
            store,
            processor,
            target,
            user_start,
            loop_interval,
            inactive_time_limit_ms,
            pump_manager: Arc::new(PumpManager::new()),
            running: AtomicBool::new(false),
            run_state: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent: calling `start` on an already-running processor is a
    /// no-op. Spawns a fresh supervisory loop bound to a new cancellation
    /// token, replacing any token left over from a prior run.
    pub async fn start(self: &Arc<Self>) {
        let mut run_state = self.run_state.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let loop_handle = tokio::spawn(async move {
            this.run_loop(loop_cancel).await;
        });

        *run_state = Some(RunState { cancel, loop_handle });
    }

    /// Idempotent: calling `stop` on an already-stopped processor is a
    /// no-op. Cancels the supervisory loop, closes every live pump with
    /// `Shutdown`, waits for the loop task to finish, then, for a balanced
    /// target, abandons this instance's ownerships so peers can reclaim
    /// them without waiting on the inactivity timer.
    pub async fn stop(self: &Arc<Self>) {
        let state = {
            let mut run_state = self.run_state.lock().await;
            run_state.take()
        };
        let Some(state) = state else {
            return;
        };
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        state.cancel.cancel();
        self.pump_manager.remove_all_pumps(CloseReason::Shutdown).await;
        if let Err(error) = state.loop_handle.await {
            tracing::warn!(%error, "supervisory loop task panicked while stopping");
        }

        if matches!(self.target, Target::Balanced(_)) {
            self.abandon_partition_ownerships().await;
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        match &self.target {
            Target::Fixed(partition_id) => {
                let partition_id = partition_id.clone();
                // No ownership interaction, no load balancing: just keep
                // the one pump alive (idempotent) on every tick.
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.start_pump(&partition_id).await;
                    if self.interruptible_sleep(self.loop_interval, &cancel).await {
                        break;
                    }
                }
            }
            Target::Balanced(balancer) => {
                let balancer = Arc::clone(balancer);
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(error) = self.balanced_iteration(balancer.as_ref(), &cancel).await {
                        if error.is_cancelled() {
                            break;
                        }
                        self.report_coordination_error(error).await;
                    }
                    if self.interruptible_sleep(self.loop_interval, &cancel).await {
                        break;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` if
    /// cancellation was observed instead of the sleep completing.
    async fn interruptible_sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// One pass of the balance loop: fetch ownerships, fetch the
    /// partition universe, ask the balancer for at most one claim, attempt
    /// it, and start a pump on success. Mirrors spec §4.2's balanced loop
    /// steps exactly.
    async fn balanced_iteration(
        &self,
        balancer: &dyn LoadBalancer,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError> {
        let ownerships = self
            .store
            .list_ownership(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            )
            .await?;

        let mut abandoned: HashMap<String, PartitionOwnership> = HashMap::new();
        let mut live: HashMap<String, PartitionOwnership> = HashMap::new();
        for ownership in ownerships {
            if ownership.is_abandoned() {
                abandoned.insert(ownership.partition_id.clone(), ownership);
            } else {
                live.insert(ownership.partition_id.clone(), ownership);
            }
        }

        let partition_ids = self.transport.get_partition_ids(cancel.clone()).await?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let now_ms = pcoord_common::now_ms();
        let ctx = BalanceContext {
            owner_id: &self.id,
            live: &live,
            partition_ids: &partition_ids,
            now_ms,
            inactive_time_limit_ms: self.inactive_time_limit_ms,
        };
        let claims = balancer.choose_claims(&ctx);

        for partition_id in claims {
            let existing = abandoned
                .get(&partition_id)
                .or_else(|| live.get(&partition_id));
            let request = PartitionOwnership {
                fully_qualified_namespace: self.fully_qualified_namespace.clone(),
                event_hub_name: self.event_hub_name.clone(),
                consumer_group: self.consumer_group.clone(),
                partition_id: partition_id.clone(),
                owner_id: self.id.clone(),
                last_modified_time_ms: now_ms,
                etag: existing.and_then(|o| o.etag.clone()),
            };

            let claimed = self.store.claim_ownership(vec![request]).await?;
            if claimed.iter().any(|o| o.partition_id == partition_id) {
                self.start_pump(&partition_id).await;
            }
            // A claim that did not appear in the result lost the race to
            // another instance; this is not an error (spec §7).
        }

        Ok(())
    }

    async fn start_pump(&self, partition_id: &str) {
        if self.pump_manager.is_receiving_from_partition(partition_id).await {
            return;
        }

        let start_position = self.resolve_starting_position(partition_id).await;
        let context = PartitionContext::new(
            self.fully_qualified_namespace.clone(),
            self.event_hub_name.clone(),
            self.consumer_group.clone(),
            partition_id.to_owned(),
            Arc::clone(&self.store),
        );

        let run_state = self.run_state.lock().await;
        let Some(state) = run_state.as_ref() else {
            return;
        };
        self.pump_manager
            .create_pump(
                Arc::clone(&self.transport),
                Arc::clone(&self.processor),
                context,
                start_position,
                &state.cancel,
            )
            .await;
    }

    /// Checkpoint first; if none exists, fall back to the user-supplied
    /// default; if the default has no entry for this partition either,
    /// fall back to `Latest`.
    async fn resolve_starting_position(&self, partition_id: &str) -> EventPosition {
        let checkpoints = self
            .store
            .list_checkpoints(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            )
            .await
            .unwrap_or_default();

        if let Some(checkpoint) = checkpoints.into_iter().find(|c| c.partition_id == partition_id) {
            if let Some(offset) = checkpoint.offset {
                return EventPosition::Offset(offset);
            }
            if let Some(sequence_number) = checkpoint.sequence_number {
                return EventPosition::SequenceNumber(sequence_number);
            }
        }

        match &self.user_start {
            UserStart::Single(position) => position.clone(),
            UserStart::PerPartition(map) => map
                .get(partition_id)
                .cloned()
                .unwrap_or(EventPosition::Latest),
        }
    }

    /// Sets this instance's live ownerships' `owner_id` to empty so peers
    /// can reclaim them immediately rather than waiting on the inactivity
    /// timer. Per Open Question (b), a failed write here is logged and
    /// discarded, not retried: the inactivity timer is the fallback.
    async fn abandon_partition_ownerships(&self) {
        let ownerships = match self
            .store
            .list_ownership(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            )
            .await
        {
            Ok(ownerships) => ownerships,
            Err(error) => {
                tracing::warn!(%error, "failed to list ownerships while abandoning");
                return;
            }
        };

        let mine: Vec<PartitionOwnership> = ownerships
            .into_iter()
            .filter(|o| o.owner_id == self.id)
            .map(|mut o| {
                o.owner_id = String::new();
                o
            })
            .collect();

        if mine.is_empty() {
            return;
        }

        if let Err(error) = self.store.claim_ownership(mine).await {
            tracing::warn!(%error, "failed to abandon partition ownerships on stop");
        }
    }

    async fn report_coordination_error(&self, error: ProcessorError) {
        if error.is_cancelled() {
            return;
        }
        let context = ErrorContext::coordination(
            self.fully_qualified_namespace.clone(),
            self.event_hub_name.clone(),
            self.consumer_group.clone(),
        );
        let processor = Arc::clone(&self.processor);
        let outcome = std::panic::AssertUnwindSafe(processor.process_error(error, &context))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!("user process_error handler panicked; swallowed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use pcoord_common::model::ReceivedEvent;
    use pcoord_memstore::{FakeTransport, InMemoryCheckpointStore};

    struct CountingProcessor {
        events: AtomicUsize,
        closes: AtomicUsize,
    }

    impl CountingProcessor {
        fn new() -> Self {
            Self {
                events: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PartitionProcessor for CountingProcessor {
        async fn process_events(&self, events: Vec<ReceivedEvent>, context: &PartitionContext) {
            self.events.fetch_add(events.len(), Ordering::SeqCst);
            if let Some(last) = events.last() {
                let _ = context.update_checkpoint(last).await;
            }
        }

        async fn process_error(&self, _error: ProcessorError, _context: &ErrorContext) {}

        async fn process_close(&self, _reason: CloseReason, _context: &PartitionContext) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fixed_target_starts_exactly_one_pump_and_delivers_events() {
        let transport = Arc::new(FakeTransport::new("ns", "hub", vec!["0".to_owned()], 3));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor_impl = Arc::new(CountingProcessor::new());

        let processor = Arc::new(EventProcessor::new(
            "owner-a".to_owned(),
            "group".to_owned(),
            Arc::clone(&transport),
            store,
            Arc::clone(&processor_impl) as Arc<dyn PartitionProcessor>,
            Target::Fixed("0".to_owned()),
            UserStart::default(),
            Duration::from_millis(20),
            60_000,
        ));

        processor.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.stop().await;

        assert!(processor_impl.events.load(Ordering::SeqCst) > 0);
        assert_eq!(processor_impl.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn balanced_target_claims_every_partition_eventually() {
        let transport = Arc::new(FakeTransport::new(
            "ns",
            "hub",
            vec!["0".to_owned(), "1".to_owned(), "2".to_owned()],
            1,
        ));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor_impl = Arc::new(CountingProcessor::new());

        let processor = Arc::new(EventProcessor::new(
            "owner-a".to_owned(),
            "group".to_owned(),
            Arc::clone(&transport),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::clone(&processor_impl) as Arc<dyn PartitionProcessor>,
            Target::Balanced(Arc::new(crate::balancer::FairLoadBalancer)),
            UserStart::default(),
            Duration::from_millis(10),
            60_000,
        ));

        processor.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let ownerships = store
            .list_ownership("ns", "hub", "group")
            .await
            .expect("list_ownership");
        assert_eq!(ownerships.iter().filter(|o| !o.is_abandoned()).count(), 3);

        processor.stop().await;

        let ownerships = store
            .list_ownership("ns", "hub", "group")
            .await
            .expect("list_ownership");
        assert!(ownerships.iter().all(|o| o.is_abandoned()));
    }

    #[tokio::test]
    async fn resumes_from_stored_checkpoint_offset_over_user_default() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store
            .update_checkpoint(pcoord_common::model::Checkpoint {
                fully_qualified_namespace: "ns".to_owned(),
                event_hub_name: "hub".to_owned(),
                consumer_group: "group".to_owned(),
                partition_id: "0".to_owned(),
                // Deliberately distinct from `sequence_number` so the
                // assertion below only passes if `offset` wins.
                offset: Some("100".to_owned()),
                sequence_number: Some(41),
            })
            .await
            .expect("seed checkpoint");

        let transport = Arc::new(FakeTransport::new("ns", "hub", vec!["0".to_owned()], 1));
        let processor_impl = Arc::new(CountingProcessor::new());

        let processor = Arc::new(EventProcessor::new(
            "owner-a".to_owned(),
            "group".to_owned(),
            Arc::clone(&transport),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::clone(&processor_impl) as Arc<dyn PartitionProcessor>,
            Target::Fixed("0".to_owned()),
            UserStart::Single(EventPosition::Earliest),
            Duration::from_millis(20),
            60_000,
        ));

        processor.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        processor.stop().await;

        let checkpoints = store
            .list_checkpoints("ns", "hub", "group")
            .await
            .expect("list_checkpoints");
        let checkpoint = checkpoints
            .into_iter()
            .find(|c| c.partition_id == "0")
            .expect("checkpoint for partition 0");
        // FakeTransport resumes at the stored offset + 1 (101), not at
        // `sequence_number` + 1 (42) and not at `Earliest`, which would
        // have started at 0.
        assert_eq!(checkpoint.offset, Some("101".to_owned()));
    }

    #[tokio::test]
    async fn two_instances_sharing_a_store_converge_to_an_even_split() {
        let transport = Arc::new(FakeTransport::new(
            "ns",
            "hub",
            vec![
                "0".to_owned(),
                "1".to_owned(),
                "2".to_owned(),
                "3".to_owned(),
            ],
            0,
        ));
        let store = Arc::new(InMemoryCheckpointStore::new());

        let make = |owner_id: &str| {
            Arc::new(EventProcessor::new(
                owner_id.to_owned(),
                "group".to_owned(),
                Arc::clone(&transport),
                Arc::clone(&store) as Arc<dyn CheckpointStore>,
                Arc::new(CountingProcessor::new()) as Arc<dyn PartitionProcessor>,
                Target::Balanced(Arc::new(crate::balancer::FairLoadBalancer)),
                UserStart::default(),
                Duration::from_millis(10),
                60_000,
            ))
        };
        let processor_a = make("owner-a");
        let processor_b = make("owner-b");

        processor_a.start().await;
        processor_b.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let ownerships = store
            .list_ownership("ns", "hub", "group")
            .await
            .expect("list_ownership");
        assert_eq!(ownerships.iter().filter(|o| !o.is_abandoned()).count(), 4);
        let owned_by_a = ownerships
            .iter()
            .filter(|o| o.owner_id == "owner-a")
            .count();
        let owned_by_b = ownerships
            .iter()
            .filter(|o| o.owner_id == "owner-b")
            .count();
        assert_eq!(owned_by_a, 2);
        assert_eq!(owned_by_b, 2);

        processor_a.stop().await;
        processor_b.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let transport = Arc::new(FakeTransport::new("ns", "hub", vec!["0".to_owned()], 0));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor_impl = Arc::new(CountingProcessor::new());

        let processor = Arc::new(EventProcessor::new(
            "owner-a".to_owned(),
            "group".to_owned(),
            transport,
            store,
            processor_impl as Arc<dyn PartitionProcessor>,
            Target::Fixed("0".to_owned()),
            UserStart::default(),
            Duration::from_millis(20),
            60_000,
        ));

        processor.start().await;
        processor.stop().await;
        processor.stop().await;
        assert!(!processor.is_running());
    }
}
