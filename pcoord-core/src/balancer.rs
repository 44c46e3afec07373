//! The fair load balancer: a pure, side-effect-free decision function. Kept
//! behind the [`LoadBalancer`] trait (in the shape of
//! `assignment-coordination`'s `AssignmentStrategy`) so an alternative
//! policy, greedy, sticky, or affinity-based, can be substituted without
//! touching the supervisor.

use std::collections::HashMap;

use pcoord_common::model::PartitionOwnership;

/// Everything [`LoadBalancer::choose_claims`] needs to make one decision.
/// `live` holds non-abandoned ownerships keyed by partition id; abandoned
/// rows are not passed in because they are always claimable regardless of
/// load (see [`is_stale`]/abandonment handling in the processor loop, which
/// folds abandoned rows into `partition_ids` minus `live`).
pub struct BalanceContext<'a> {
    pub owner_id: &'a str,
    pub live: &'a HashMap<String, PartitionOwnership>,
    pub partition_ids: &'a [String],
    pub now_ms: i64,
    pub inactive_time_limit_ms: i64,
}

/// A partition assignment policy, evaluated once per balance-loop
/// iteration. Returns zero or one partition ids to claim this tick; the
/// supervisor treats the result as a bounded list so a future policy may
/// legitimately return more than one.
pub trait LoadBalancer: Send + Sync {
    fn choose_claims(&self, ctx: &BalanceContext<'_>) -> Vec<String>;
}

/// `isStale`: a live ownership whose last report predates the inactivity
/// threshold is treated as reclaimable without waiting on a heartbeat
/// lease.
pub fn is_stale(ownership: &PartitionOwnership, now_ms: i64, inactive_time_limit_ms: i64) -> bool {
    now_ms - ownership.last_modified_time_ms > inactive_time_limit_ms
}

/// The default, leaderless strategy described in the design: claim at most
/// one partition per tick, preferring a steal from the most-loaded owner
/// when this instance is under quota, else any unclaimed partition.
#[derive(Default)]
pub struct FairLoadBalancer;

impl LoadBalancer for FairLoadBalancer {
    fn choose_claims(&self, ctx: &BalanceContext<'_>) -> Vec<String> {
        let BalanceContext {
            owner_id,
            live,
            partition_ids,
            now_ms,
            inactive_time_limit_ms,
        } = *ctx;

        // Step 1: active = live ownerships that are not stale.
        let active: HashMap<&str, &PartitionOwnership> = live
            .iter()
            .filter(|(_, o)| !is_stale(o, now_ms, inactive_time_limit_ms))
            .map(|(p, o)| (p.as_str(), o))
            .collect();

        // Step 2: claimable = partitions without an active owner (covers
        // both never-claimed partitions and stale ones).
        let mut claimable: Vec<&str> = partition_ids
            .iter()
            .map(|p| p.as_str())
            .filter(|p| !active.contains_key(p))
            .collect();
        claimable.sort_unstable();

        // Step 3: bucket active ownerships by owner, including self at 0.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        counts.entry(owner_id).or_insert(0);
        for ownership in active.values() {
            *counts.entry(ownership.owner_id.as_str()).or_insert(0) += 1;
        }

        let owner_count = counts.len().max(1);
        let total = partition_ids.len();
        let min = total / owner_count;

        let self_count = *counts.get(owner_id).unwrap_or(&0);

        // Step 5: steal from the most-loaded other owner, if we are below
        // min and that owner is above min. Ties broken by owner id so the
        // decision is deterministic across instances observing the same
        // state.
        if self_count < min {
            let most_loaded = counts
                .iter()
                .filter(|(owner, _)| **owner != owner_id)
                .max_by_key(|(owner, count)| (**count, std::cmp::Reverse(owner.to_string())));

            if let Some((most_loaded_owner, most_loaded_count)) = most_loaded {
                if *most_loaded_count > min {
                    let mut owned_by_most_loaded: Vec<&str> = active
                        .iter()
                        .filter(|(_, o)| o.owner_id == *most_loaded_owner)
                        .map(|(p, _)| *p)
                        .collect();
                    owned_by_most_loaded.sort_unstable();
                    if let Some(partition) = owned_by_most_loaded.into_iter().next() {
                        return vec![partition.to_owned()];
                    }
                }
            }
        }

        // Step 6: otherwise take any claimable partition.
        if let Some(partition) = claimable.into_iter().next() {
            return vec![partition.to_owned()];
        }

        // Step 7: balanced, nothing to do this tick.
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ownership(owner: &str, partition: &str, last_modified_time_ms: i64) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: "ns".to_owned(),
            event_hub_name: "hub".to_owned(),
            consumer_group: "group".to_owned(),
            partition_id: partition.to_owned(),
            owner_id: owner.to_owned(),
            last_modified_time_ms,
            etag: Some(format!("{owner}-{partition}-etag")),
        }
    }

    fn partitions(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn empty_store_claims_first_partition() {
        let live = HashMap::new();
        let ctx = BalanceContext {
            owner_id: "a",
            live: &live,
            partition_ids: &partitions(4),
            now_ms: 1_000,
            inactive_time_limit_ms: 60_000,
        };
        let claims = FairLoadBalancer.choose_claims(&ctx);
        assert_eq!(claims, vec!["0".to_owned()]);
    }

    #[test]
    fn balanced_fleet_claims_nothing() {
        let mut live = HashMap::new();
        live.insert("0".to_owned(), ownership("a", "0", 1_000));
        live.insert("1".to_owned(), ownership("b", "1", 1_000));
        let ctx = BalanceContext {
            owner_id: "a",
            live: &live,
            partition_ids: &partitions(2),
            now_ms: 1_000,
            inactive_time_limit_ms: 60_000,
        };
        assert!(FairLoadBalancer.choose_claims(&ctx).is_empty());
    }

    #[test]
    fn under_quota_owner_steals_from_most_loaded() {
        let mut live = HashMap::new();
        for p in 0..4 {
            live.insert(p.to_string(), ownership("a", &p.to_string(), 1_000));
        }
        let ctx = BalanceContext {
            owner_id: "b",
            live: &live,
            partition_ids: &partitions(4),
            now_ms: 1_000,
            inactive_time_limit_ms: 60_000,
        };
        let claims = FairLoadBalancer.choose_claims(&ctx);
        assert_eq!(claims.len(), 1);
        assert!(live.contains_key(&claims[0]));
    }

    #[test]
    fn stale_ownership_is_claimable_without_stealing() {
        let mut live = HashMap::new();
        live.insert("0".to_owned(), ownership("a", "0", 0));
        let ctx = BalanceContext {
            owner_id: "b",
            live: &live,
            partition_ids: &partitions(1),
            now_ms: 100_000,
            inactive_time_limit_ms: 60_000,
        };
        let claims = FairLoadBalancer.choose_claims(&ctx);
        assert_eq!(claims, vec!["0".to_owned()]);
    }

    #[test]
    fn single_owner_claims_every_remaining_partition_over_iterations() {
        let mut live = HashMap::new();
        let ids = partitions(4);
        for _ in 0..4 {
            let ctx = BalanceContext {
                owner_id: "a",
                live: &live,
                partition_ids: &ids,
                now_ms: 1_000,
                inactive_time_limit_ms: 60_000,
            };
            let claims = FairLoadBalancer.choose_claims(&ctx);
            assert_eq!(claims.len(), 1, "balancer should claim exactly one partition per tick while unbalanced");
            let partition = claims[0].clone();
            live.insert(partition.clone(), ownership("a", &partition, 1_000));
        }
        assert_eq!(live.len(), 4);
    }

    #[test]
    fn two_owners_converge_to_even_split() {
        let mut live = HashMap::new();
        for p in 0..4 {
            live.insert(p.to_string(), ownership("a", &p.to_string(), 1_000));
        }
        let ids = partitions(4);
        // B steals until the fleet is balanced; A never claims because it
        // is never below min.
        for _ in 0..4 {
            let ctx = BalanceContext {
                owner_id: "b",
                live: &live,
                partition_ids: &ids,
                now_ms: 1_000,
                inactive_time_limit_ms: 60_000,
            };
            let claims = FairLoadBalancer.choose_claims(&ctx);
            if claims.is_empty() {
                break;
            }
            let partition = claims[0].clone();
            live.insert(partition.clone(), ownership("b", &partition, 1_000));
        }
        let a_count = live.values().filter(|o| o.owner_id == "a").count();
        let b_count = live.values().filter(|o| o.owner_id == "b").count();
        assert_eq!(a_count, 2);
        assert_eq!(b_count, 2);
    }
}
