//! Range leases and the post-apply installation of a new lease.
//!
//! A lease grants one replica the right to serve reads and writes for its
//! range without contacting consensus. Leases replicate like any other side
//! effect; installation happens at apply time on every replica, and the
//! sequence-number discipline enforced here is what keeps the replicas'
//! pictures of lease ownership from silently diverging.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::replica::Replica;
use crate::store::{node_liveness_span, CapacityChangeEvent};
use crate::types::{ReplicaDescriptor, StoreId};

/// Discriminates how a lease expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseType {
    /// Valid until its expiration timestamp; proactively renewed by the
    /// store's renewer worker.
    Expiration,
    /// Tied to the holder node's liveness epoch; stays valid as long as the
    /// node keeps heartbeating its liveness record.
    Epoch,
}

/// A range lease. The sequence number increments each time the lease
/// changes hands and is the anchor of the apply-time discipline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub replica: ReplicaDescriptor,
    pub start: Timestamp,
    /// Set for expiration-based leases; `None` marks an epoch-based lease.
    pub expiration: Option<Timestamp>,
    pub epoch: Option<u64>,
    pub sequence: u64,
    /// Timestamp at which the lease request was proposed. Ignored by
    /// equivalency.
    pub proposed_ts: Option<Timestamp>,
}

impl Lease {
    pub fn lease_type(&self) -> LeaseType {
        if self.epoch.is_some() {
            LeaseType::Epoch
        } else {
            LeaseType::Expiration
        }
    }

    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }

    /// Whether the lease authorizes serving at `now`. Epoch-based leases are
    /// valid as long as the epoch holds; checking the holder's liveness is
    /// the caller's business.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        match self.lease_type() {
            LeaseType::Epoch => true,
            LeaseType::Expiration => self.expiration.map_or(false, |exp| now < exp),
        }
    }

    /// Whether `other` is the same lease modulo extension. Proposal
    /// timestamps and sequence numbers are ignored; an expiration-based
    /// lease may only move its expiration forward.
    pub fn equivalent(&self, other: &Lease) -> bool {
        if self.replica != other.replica || self.start != other.start || self.epoch != other.epoch {
            return false;
        }
        match (self.expiration, other.expiration) {
            (None, None) => true,
            (Some(old), Some(new)) => new >= old,
            _ => false,
        }
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "repl=(n{},s{},{}) seq={} start={}",
            self.replica.node_id,
            self.replica.store_id,
            self.replica.replica_id,
            self.sequence,
            self.start
        )?;
        match self.lease_type() {
            LeaseType::Epoch => write!(f, " epo={}", self.epoch.unwrap_or(0)),
            LeaseType::Expiration => write!(
                f,
                " exp={}",
                self.expiration.unwrap_or_else(Timestamp::zero)
            ),
        }
    }
}

/// Bounded ring of the leases a replica has applied, oldest first.
pub struct LeaseHistory {
    entries: VecDeque<Lease>,
    capacity: usize,
}

impl LeaseHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    pub fn add(&mut self, lease: Lease) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(lease);
    }

    pub fn entries(&self) -> Vec<Lease> {
        self.entries.iter().cloned().collect()
    }
}

impl Replica {
    /// Update the replica's internal state to reflect the application of a
    /// new range lease. Idempotent for identical inputs, so it can be called
    /// repeatedly for the same lease. Crashes on a lease sequence that moves
    /// backwards, repeats with a non-equivalent lease, or jumps forward by
    /// more than one unless `permit_jump` is passed (only snapshots may
    /// legitimately jump).
    pub fn lease_post_apply(&self, new_lease: &Lease, permit_jump: bool) {
        let store = self.store();
        let (replica_id, prev_lease) = {
            let mu = self.mu.lock().expect("replica mutex poisoned");
            // This is the last lease known to this replica, which is not
            // necessarily the previous lease in the range's sequence: a
            // snapshot may have skipped some. All other update paths are
            // continuous, which is what permit_jump polices.
            (self.replica_id(), mu.state.lease.clone())
        };

        let i_am_the_lease_holder = new_lease.replica.replica_id == replica_id;
        // A restarted node always picks up a fresh sequence number, so the
        // sequence comparison fires even when the store id does not change.
        let lease_changing_hands = prev_lease.replica.store_id != new_lease.replica.store_id
            || prev_lease.sequence != new_lease.sequence;

        if i_am_the_lease_holder
            && lease_changing_hands
            && new_lease.lease_type() == LeaseType::Epoch
        {
            tracing::info!(
                range_id = self.range_id(),
                new = %new_lease,
                prev = %prev_lease,
                "new range lease"
            );
        }

        if lease_changing_hands && i_am_the_lease_holder {
            // Only the old leaseholder is told about an in-progress merge, so
            // a new holder has to go look for one before serving anything.
            if let Err(err) = self.maybe_watch_for_merge() {
                tracing::error!(
                    range_id = self.range_id(),
                    error = ?err,
                    "failed checking for in-progress merge while installing new lease"
                );
                panic!(
                    "failed checking for in-progress merge while installing new lease {new_lease}: {err}"
                );
            }

            // A transferred lease formally overlaps its predecessor (the old
            // holder promised to stop serving), so the low water mark comes
            // from the new lease's start, not the old lease's expiration.
            store.ts_cache.set_low_water(self.range_id(), new_lease.start);

            self.leaseholder_stats.reset_request_counts();
        }

        if prev_lease.sequence != 0 {
            // This replica is past the sequence-number migration; enforce the
            // discipline.
            let (s1, s2) = (prev_lease.sequence, new_lease.sequence);
            if s2 < s1 {
                panic!("lease sequence inversion, prev_lease={prev_lease}, new_lease={new_lease}");
            } else if s2 == s1 {
                // Same sequence must mean the same lease; extensions and the
                // split path both re-install an equivalent lease.
                if !prev_lease.equivalent(new_lease) {
                    panic!(
                        "sequence identical for different leases, prev_lease={prev_lease}, new_lease={new_lease}"
                    );
                }
            } else if s2 > s1 + 1 && !permit_jump {
                panic!("lease sequence jump, prev_lease={prev_lease}, new_lease={new_lease}");
            }
        }

        // Install only after the merge check and timestamp cache update. In
        // the reversed order a request could see the new lease without the
        // barriers it implies, breaking serializability.
        {
            let mut mu = self.mu.lock().expect("replica mutex poisoned");
            mu.state.lease = new_lease.clone();
        }

        let now = store.clock().now();

        // Gossip the first range whenever its lease is acquired; the validity
        // check keeps a trailing replica that processes an old lease request
        // from gossiping stale routing data.
        if lease_changing_hands
            && i_am_the_lease_holder
            && self.is_first_range()
            && new_lease.is_valid_at(now)
        {
            store.gossip().gossip_first_range(self.range_id());
        }

        // A fresh expiration-based lease needs the renewer worker to keep it
        // alive; register and wake the worker without blocking on it.
        if lease_changing_hands
            && i_am_the_lease_holder
            && new_lease.lease_type() == LeaseType::Expiration
            && new_lease.is_valid_at(now)
        {
            store.register_renewable_lease(self.range_id());
        }

        if lease_changing_hands && !i_am_the_lease_holder {
            // Waiters must redirect to the new lease holder.
            self.txn_wait_queue.clear(true);
        }

        // If this replica leads the consensus group, leadership should follow
        // the lease. Also checked periodically on tick.
        self.maybe_transfer_raft_leadership();

        let prev_owner = prev_lease.owned_by(store.store_id());
        let current_owner = new_lease.owned_by(store.store_id());
        if lease_changing_hands && (prev_owner || current_owner) {
            if current_owner {
                store.maybe_gossip_on_capacity_change(CapacityChangeEvent::LeaseAdd);
            } else {
                store.maybe_gossip_on_capacity_change(CapacityChangeEvent::LeaseRemove);
            }
            self.leaseholder_stats.reset_request_counts();
        }

        if i_am_the_lease_holder {
            // Re-gossip system data best effort; liveness re-gossips every
            // few seconds anyway and the system config range reacquires its
            // lease rarely, so there is no point minimizing these.
            if let Err(err) = store.gossip().maybe_gossip_system_config() {
                tracing::error!(error = ?err, "failed to gossip system config");
            }
            if let Err(err) = store.gossip().maybe_gossip_node_liveness(&node_liveness_span()) {
                tracing::error!(error = ?err, "failed to gossip node liveness");
            }

            self.txn_wait_queue.enable();

            // Followers look for a lease-applied hint after an ownership
            // change; emit one so they don't have to ask.
            self.emit_lease_applied_hint();
        }

        self.lease_history
            .lock()
            .expect("lease history mutex poisoned")
            .add(new_lease.clone());
    }
}
