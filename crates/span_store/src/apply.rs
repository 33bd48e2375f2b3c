//! Applying committed commands.
//!
//! Every replica processes commands in strict log order under the raft
//! mutex: ingest any sideloaded SSTable, apply the write batch, then consume
//! the replicated result field by field. The result struct doubles as a
//! checklist; each handled field is cleared, and a residual non-zero field
//! at the end is a replica-divergence bug that crashes the process rather
//! than being tolerated.
//!
//! Ordering within one apply is load-bearing. Splits and merges run after
//! the stats delta because carved-out stats may contain estimates, and a
//! new lease installs only after the timestamp-cache and merge-watch
//! barriers it implies.

use std::time::Instant;

use crate::command::{RaftCommand, ReplicatedEvalResult, ReplicaChangeType, ReplicaStateDelta};
use crate::hlc::Timestamp;
use crate::replica::Replica;
use crate::result::{LocalResult, ProposalResult};
use crate::stats::MvccStatsDelta;
use crate::types::CmdId;
use crate::{command, ingest};

/// A command popped from the consensus log, ready to apply.
#[derive(Clone, Debug)]
pub struct CommittedEntry {
    pub term: u64,
    pub index: u64,
    pub id: CmdId,
    pub data: bytes::Bytes,
}

/// Crash if any field of the replicated result survived application.
pub fn assert_replicated_result_exhausted(res: &ReplicatedEvalResult) {
    if *res != ReplicatedEvalResult::default() {
        panic!(
            "unhandled field in replicated eval result; diff from zero value: {res:#?}"
        );
    }
}

/// Crash if any field of the local result survived application.
pub fn assert_local_result_exhausted(res: &LocalResult) {
    if *res != LocalResult::default() {
        panic!("unhandled field in local eval result; diff from zero value: {res:#?}");
    }
}

impl Replica {
    /// Decode and apply one committed entry end to end: sideloaded
    /// ingestion, write batch, both result halves, and proposal completion
    /// for the proposer.
    pub fn apply_committed_entry(&self, entry: &CommittedEntry) -> anyhow::Result<()> {
        use anyhow::Context;
        let command = command::decode_raft_command(&entry.data)
            .with_context(|| format!("decoding command at index {}", entry.index))?;
        self.apply_raft_command(entry.term, entry.index, entry.id, command);
        Ok(())
    }

    /// Apply a decoded command. Serialized per replica by the raft mutex;
    /// an apply completes before the next begins.
    pub fn apply_raft_command(&self, term: u64, index: u64, id: CmdId, mut command: RaftCommand) {
        let _raft_guard = self.raft_mu.lock().expect("raft mutex poisoned");
        let store = self.store();

        // The sideloaded SSTable lands in the engine before the write batch
        // so the batch sees its effects.
        if let Some(sst) = command.replicated.add_sstable.take() {
            let copied = ingest::add_sstable_pre_apply(
                store.cfg(),
                self.engine().as_ref(),
                self.sideloaded.as_ref(),
                term,
                index,
                &sst,
            );
            store.metrics.record_sst_ingest(copied);
        }

        if let Some(write_batch) = command.write_batch.take() {
            if let Err(err) = self.engine().apply_batch(&write_batch) {
                // The other replicas will apply this batch; failing to is
                // divergence.
                panic!("unable to apply write batch at index {index}: {err}");
            }
        }
        // Consumed downstream by change feeds; none are attached here.
        command.logical_op_log = None;

        let mut proposal = {
            self.mu
                .lock()
                .expect("replica mutex poisoned")
                .pending_proposals
                .remove(&id)
        };

        let mut result = ProposalResult::default();
        let mut local = None;
        if let Some(proposal) = proposal.as_mut() {
            if let Some(mut local_result) = proposal.local.take() {
                result.reply = local_result.reply.take();
                result.intents = local_result.detach_intents();
                result.end_txns = local_result.detach_end_txns(false);
                local = Some(local_result);
            }
        }

        self.handle_eval_result(local, command.replicated, index, command.max_lease_index);

        if let Some(mut proposal) = proposal {
            proposal.finish_application(result);
        }
    }

    /// Apply both result halves and, for nontrivial commands, assert that
    /// the in-memory and on-disk replica states still agree.
    pub fn handle_eval_result(
        &self,
        local: Option<LocalResult>,
        replicated: ReplicatedEvalResult,
        raft_applied_index: u64,
        lease_applied_index: u64,
    ) {
        let should_assert =
            self.handle_replicated_eval_result(replicated, raft_applied_index, lease_applied_index);
        if let Some(local) = local {
            self.handle_local_eval_result(local);
        }
        self.persist_state();
        if should_assert {
            self.assert_state();
        }
    }

    /// Consume the replicated half of a committed result on this replica.
    /// Returns whether the caller must assert in-memory/on-disk agreement;
    /// commands carrying only the trivial updates (stats, truncation,
    /// raft-log size) do not warrant the expensive check.
    pub fn handle_replicated_eval_result(
        &self,
        mut res: ReplicatedEvalResult,
        raft_applied_index: u64,
        lease_applied_index: u64,
    ) -> bool {
        let store = self.store();

        // Observational fields; no action is taken for them here.
        {
            res.is_lease_request = false;
            res.timestamp = Timestamp::zero();
            res.prev_lease_proposal = None;
        }

        // Holding the read barrier for the rest of application gives
        // subsequent reads a clean cut.
        let mut _read_barrier = None;
        if res.block_reads {
            _read_barrier = Some(
                self.read_only_cmd_mu
                    .write()
                    .expect("read-only command lock poisoned"),
            );
            res.block_reads = false;
        }

        // A proposer behind the stats migration embeds the full struct
        // instead of a delta.
        let delta_stats = match res.deprecated_delta.take() {
            Some(full) => full.to_delta(),
            None => res.delta,
        };
        res.delta = MvccStatsDelta::default();

        let (needs_split, needs_merge) = {
            let mut mu = self.mu.lock().expect("replica mutex poisoned");
            mu.state.stats.add(delta_stats);
            if raft_applied_index != 0 {
                mu.state.raft_applied_index = raft_applied_index;
            }
            if lease_applied_index != 0 {
                mu.state.lease_applied_index = lease_applied_index;
            }
            (
                self.needs_split_by_size_locked(&mu, store.cfg().range_max_bytes),
                self.needs_merge_by_size_locked(&mu, store.cfg().range_min_bytes),
            )
        };
        store.metrics.add_mvcc_stats(delta_stats);

        let now = store.clock().now();
        if needs_split && self.split_queue_throttle.should_process(Instant::now()) {
            store.split_queue.maybe_add_async(self.range_id(), now);
        }
        if needs_merge && self.merge_queue_throttle.should_process(Instant::now()) {
            store.merge_queue.maybe_add_async(self.range_id(), now);
        }

        // The updates above are always present. The ones below are not, but
        // are either too frequent to justify a state assertion or leave the
        // asserted state untouched.

        if let Some(state) = res.state.as_mut() {
            if let Some(truncated) = state.truncated_state.take() {
                {
                    let mut mu = self.mu.lock().expect("replica mutex poisoned");
                    mu.state.truncated_state = truncated;
                }
                // Cached entries at or below the truncation point are dead.
                store
                    .raft_entry_cache
                    .clear(self.range_id(), truncated.index + 1);

                // Safe only while the new truncated state is synced to disk
                // before this point, which it is.
                tracing::debug!(
                    range_id = self.range_id(),
                    index = truncated.index,
                    "truncating sideloaded storage"
                );
                match self.sideloaded.truncate_to(truncated.index + 1) {
                    Ok((freed, _retained)) => {
                        res.raft_log_delta -= freed as i64;
                    }
                    Err(err) => {
                        // Not required for correctness; complain loudly and
                        // keep going.
                        tracing::error!(
                            error = ?err,
                            "while removing sideloaded files during log truncation"
                        );
                    }
                }
            }

            // Proposers that predate incremental deltas encode a zero-value
            // stats struct; decoded, it must not look like an unhandled
            // field.
            if let Some(stats) = state.stats {
                if stats.is_zero() {
                    state.stats = None;
                }
            }

            if state.using_applied_state_key {
                let mu = self.mu.lock().expect("replica mutex poisoned");
                // Already migrated: the flag is idempotent, but clear it
                // before the should-assert determination so re-sends don't
                // force repeated assertions.
                if mu.state.using_applied_state_key {
                    state.using_applied_state_key = false;
                }
            }

            if *state == ReplicaStateDelta::default() {
                res.state = None;
            }
        }

        if res.raft_log_delta != 0 {
            {
                let mut mu = self.mu.lock().expect("replica mutex poisoned");
                mu.raft_log_size += res.raft_log_delta;
                mu.raft_log_last_check_size += res.raft_log_delta;
                // Not persisted between restarts, so it may run negative;
                // clamp instead.
                if mu.raft_log_size < 0 {
                    mu.raft_log_size = 0;
                }
                if mu.raft_log_last_check_size < 0 {
                    mu.raft_log_last_check_size = 0;
                }
            }
            res.raft_log_delta = 0;
        } else {
            // Not a truncation command. Queue a truncation check once
            // another stale-size worth of log has accumulated, rather than
            // inspecting the log on every write.
            let check_raft_log = {
                let mut mu = self.mu.lock().expect("replica mutex poisoned");
                let check = mu.raft_log_size - mu.raft_log_last_check_size
                    >= store.cfg().raft_log_queue_stale_size;
                if check {
                    mu.raft_log_last_check_size = mu.raft_log_size;
                }
                check
            };
            if check_raft_log {
                store.raft_log_queue.maybe_add_async(self.range_id(), now);
            }
        }

        for suggestion in res.suggested_compactions.drain(..) {
            store.compactor.suggest(suggestion);
        }

        // Everything below is nontrivial: it can move the in-memory and
        // on-disk states far apart, so its presence demands the divergence
        // assertion.
        let should_assert = res != ReplicatedEvalResult::default();

        // Split/merge run after the stats update because the carved-out
        // stats may contain estimates.
        if let Some(split) = res.split.take() {
            store.split_post_apply(self, &split);
        }

        if let Some(merge) = res.merge.take() {
            if let Err(err) = store.merge_range(self, &merge) {
                // The on-disk state already committed to this merge.
                panic!("failed to update store after merging range: {err}");
            }
        }

        if let Some(state) = res.state.as_mut() {
            if let Some(desc) = state.desc.take() {
                self.set_desc(desc);
            }

            if let Some(lease) = state.lease.take() {
                self.lease_post_apply(&lease, false);
            }

            if let Some(threshold) = state.gc_threshold.take() {
                if !threshold.is_zero() {
                    let mut mu = self.mu.lock().expect("replica mutex poisoned");
                    mu.state.gc_threshold = threshold;
                }
            }

            if let Some(threshold) = state.txn_span_gc_threshold.take() {
                if !threshold.is_zero() {
                    let mut mu = self.mu.lock().expect("replica mutex poisoned");
                    mu.state.txn_span_gc_threshold = threshold;
                }
            }

            if state.using_applied_state_key {
                {
                    let mut mu = self.mu.lock().expect("replica mutex poisoned");
                    mu.state.using_applied_state_key = true;
                }
                state.using_applied_state_key = false;
            }

            if *state == ReplicaStateDelta::default() {
                res.state = None;
            }
        }

        if let Some(change) = res.change_replicas.take() {
            if change.change_type == ReplicaChangeType::RemoveReplica
                && store.store_id() == change.replica.store_id
            {
                // Run as late as possible: processing the removal looks the
                // range up at the leaseholder, and being early makes that a
                // no-op.
                store.replica_gc_queue.maybe_add_async(self.range_id(), now);
            }
        }

        if let Some(compute_checksum) = res.compute_checksum.take() {
            self.compute_checksum_post_apply(compute_checksum);
        }

        assert_replicated_result_exhausted(&res);
        should_assert
    }

    /// Consume the proposer-only half of a committed result. Runs after the
    /// replicated half, on the proposing replica only.
    pub fn handle_local_eval_result(&self, mut res: LocalResult) {
        let store = self.store();

        // The reply belongs to the proposal, not to this applier.
        {
            res.reply = None;
        }

        // The caller is required to detach and handle these.
        if res.intents.is_some() {
            panic!("LocalResult.intents must be detached by the caller: {:?}", res.intents);
        }
        if res.end_txns.is_some() {
            panic!("LocalResult.end_txns must be detached by the caller: {:?}", res.end_txns);
        }

        if res.gossip_first_range {
            // Gossiping needs the range lease, and lease acquisition can't
            // make progress while this task holds the raft mutex; run it
            // asynchronously.
            let gossip = store.gossip().clone();
            let range_id = self.range_id();
            if let Err(err) = store.stopper().run_async_task(
                "replica: gossiping first range",
                async move {
                    gossip.gossip_first_range(range_id);
                },
            ) {
                tracing::info!(error = ?err, "unable to gossip first range");
            }
            res.gossip_first_range = false;
        }

        if res.maybe_add_to_split_queue {
            store
                .split_queue
                .maybe_add_async(self.range_id(), store.clock().now());
            res.maybe_add_to_split_queue = false;
        }

        if res.maybe_gossip_system_config {
            if let Err(err) = store.gossip().maybe_gossip_system_config() {
                tracing::error!(error = ?err, "failed to gossip system config");
            }
            res.maybe_gossip_system_config = false;
        }

        if let Some(span) = res.maybe_gossip_node_liveness.take() {
            if let Err(err) = store.gossip().maybe_gossip_node_liveness(&span) {
                tracing::error!(error = ?err, "failed to gossip node liveness");
            }
        }

        if let Some(metrics) = res.metrics.take() {
            store.metrics.handle_metrics_result(metrics);
        }

        if let Some(txns) = res.updated_txns.take() {
            for txn in txns {
                self.txn_wait_queue.update_txn(txn);
            }
        }

        assert_local_result_exhausted(&res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{
        ChangeReplicas, MergeTrigger, SuggestedCompaction, TruncatedState,
    };
    use crate::replica::testing::harness;
    use crate::types::{KeySpan, RangeDescriptor, ReplicaDescriptor};

    fn delta(live_bytes: i64) -> MvccStatsDelta {
        MvccStatsDelta {
            live_bytes,
            ..Default::default()
        }
    }

    #[test]
    fn trivial_apply_updates_stats_without_asserting() {
        let h = harness(1);
        let res = ReplicatedEvalResult {
            delta: delta(10),
            ..Default::default()
        };
        let should_assert = h.replica.handle_replicated_eval_result(res, 5, 2);
        assert!(!should_assert, "trivial commands must not trigger the divergence check");
        assert_eq!(h.replica.stats().live_bytes, 10);
        assert_eq!(h.replica.applied_indices(), (5, 2));
    }

    #[test]
    fn deprecated_full_stats_are_folded_in() {
        let h = harness(1);
        let res = ReplicatedEvalResult {
            deprecated_delta: Some(delta(25).to_stats()),
            ..Default::default()
        };
        let should_assert = h.replica.handle_replicated_eval_result(res, 1, 1);
        assert!(!should_assert);
        assert_eq!(h.replica.stats().live_bytes, 25);
    }

    #[test]
    fn raft_log_size_is_clamped_at_zero() {
        let h = harness(1);
        for (delta, expected) in [(100i64, 100i64), (-300, 0), (50, 50), (-20, 30), (-100, 0)] {
            let res = ReplicatedEvalResult {
                raft_log_delta: delta,
                ..Default::default()
            };
            h.replica.handle_replicated_eval_result(res, 0, 0);
            assert_eq!(h.replica.raft_log_size(), expected);
            assert!(h.replica.raft_log_size() >= 0);
        }
    }

    #[test]
    fn accumulated_log_growth_enqueues_raft_log_queue() {
        let h = harness(1);
        // Growth reported by one command...
        let res = ReplicatedEvalResult {
            raft_log_delta: h.store.cfg().raft_log_queue_stale_size + 1,
            ..Default::default()
        };
        h.replica.handle_replicated_eval_result(res, 0, 0);
        assert!(h.store.raft_log_queue.pending().is_empty());

        // ...is noticed by the next command without a delta.
        h.replica
            .handle_replicated_eval_result(ReplicatedEvalResult::default(), 0, 0);
        assert_eq!(h.store.raft_log_queue.pending().len(), 1);

        // The check point advanced, so the following command stays quiet.
        h.replica
            .handle_replicated_eval_result(ReplicatedEvalResult::default(), 0, 0);
        assert_eq!(h.store.raft_log_queue.pending().len(), 1);
    }

    #[test]
    fn truncation_clears_entry_cache_and_sideloaded_files() {
        let h = harness(1);
        for index in 1..=10 {
            h.store.raft_entry_cache.add(1, index, 128);
        }
        h.replica.sideloaded.put(2, 1, &[0u8; 500]).expect("put");
        h.replica.sideloaded.put(8, 1, &[0u8; 100]).expect("put");

        // Seed the size counter so the reclaimed bytes have something to
        // come out of.
        h.replica.handle_replicated_eval_result(
            ReplicatedEvalResult {
                raft_log_delta: 1000,
                ..Default::default()
            },
            0,
            0,
        );

        let res = ReplicatedEvalResult {
            state: Some(ReplicaStateDelta {
                truncated_state: Some(TruncatedState { index: 5, term: 1 }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let should_assert = h.replica.handle_replicated_eval_result(res, 0, 0);
        assert!(should_assert);
        assert_eq!(h.store.raft_entry_cache.len(1), 5);
        assert_eq!(h.replica.raft_log_size(), 500);
        assert!(h.replica.sideloaded.filename(2, 1).is_err());
        assert!(h.replica.sideloaded.filename(8, 1).is_ok());
    }

    #[test]
    fn suggested_compactions_reach_the_compactor() {
        let h = harness(1);
        let res = ReplicatedEvalResult {
            suggested_compactions: vec![
                SuggestedCompaction {
                    span: KeySpan::new(b"a".to_vec(), b"c".to_vec()),
                    bytes: 100,
                },
                SuggestedCompaction {
                    span: KeySpan::new(b"d".to_vec(), b"e".to_vec()),
                    bytes: 7,
                },
            ],
            ..Default::default()
        };
        h.replica.handle_replicated_eval_result(res, 0, 0);
        assert_eq!(h.store.compactor.take_suggestions().len(), 2);
    }

    #[test]
    fn removal_of_this_store_enqueues_replica_gc() {
        let h = harness(1);
        let res = ReplicatedEvalResult {
            change_replicas: Some(ChangeReplicas {
                change_type: ReplicaChangeType::RemoveReplica,
                replica: ReplicaDescriptor {
                    node_id: 1,
                    store_id: 1,
                    replica_id: 1,
                },
            }),
            ..Default::default()
        };
        h.replica.handle_replicated_eval_result(res, 0, 0);
        assert_eq!(h.store.replica_gc_queue.pending().len(), 1);

        // Removing someone else's replica does nothing here.
        let res = ReplicatedEvalResult {
            change_replicas: Some(ChangeReplicas {
                change_type: ReplicaChangeType::RemoveReplica,
                replica: ReplicaDescriptor {
                    node_id: 2,
                    store_id: 2,
                    replica_id: 2,
                },
            }),
            ..Default::default()
        };
        h.replica.handle_replicated_eval_result(res, 0, 0);
        assert_eq!(h.store.replica_gc_queue.pending().len(), 1);
    }

    #[test]
    fn single_field_results_apply_to_exhaustion() {
        // Each constructor sets exactly one field; after one apply the
        // struct must be bit-equal to its zero value, which the applier
        // itself asserts.
        let cases: Vec<Box<dyn Fn() -> ReplicatedEvalResult>> = vec![
            Box::new(|| ReplicatedEvalResult {
                is_lease_request: true,
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                timestamp: Timestamp {
                    wall_nanos: 9,
                    logical: 1,
                },
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                prev_lease_proposal: Some(Timestamp::zero()),
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                block_reads: true,
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                delta: delta(3),
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                raft_log_delta: 77,
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                suggested_compactions: vec![SuggestedCompaction::default()],
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                state: Some(ReplicaStateDelta {
                    truncated_state: Some(TruncatedState { index: 3, term: 1 }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            Box::new(|| ReplicatedEvalResult {
                change_replicas: Some(ChangeReplicas {
                    change_type: ReplicaChangeType::AddReplica,
                    replica: ReplicaDescriptor::default(),
                }),
                ..Default::default()
            }),
        ];
        for case in &cases {
            let h = harness(1);
            // Does not panic: every field is accounted for.
            h.replica.handle_replicated_eval_result(case(), 0, 0);
        }
    }

    #[test]
    #[should_panic(expected = "unhandled field in replicated eval result")]
    fn residual_replicated_field_is_fatal() {
        let res = ReplicatedEvalResult {
            raft_log_delta: 5,
            ..Default::default()
        };
        assert_replicated_result_exhausted(&res);
    }

    #[test]
    #[should_panic(expected = "must be detached by the caller")]
    fn undetached_intents_are_fatal() {
        let h = harness(1);
        let res = LocalResult {
            intents: Some(Vec::new()),
            ..Default::default()
        };
        h.replica.handle_local_eval_result(res);
    }

    #[test]
    fn local_result_applies_to_exhaustion() {
        let h = harness(1);
        let res = LocalResult {
            reply: None,
            maybe_add_to_split_queue: true,
            maybe_gossip_system_config: true,
            maybe_gossip_node_liveness: Some(crate::store::node_liveness_span()),
            metrics: Some(crate::result::MetricsDelta {
                lease_request_success: 1,
                ..Default::default()
            }),
            updated_txns: Some(Vec::new()),
            ..Default::default()
        };
        h.replica.handle_local_eval_result(res);
        assert_eq!(h.store.split_queue.pending().len(), 1);
        assert_eq!(h.store.metrics.snapshot().lease_request_success, 1);
        assert!(h
            .gossip
            .events()
            .contains(&crate::store::GossipEvent::SystemConfig));
    }

    #[test]
    fn split_then_merge_round_trips_the_replica_set() {
        use crate::command::SplitTrigger;
        use crate::store::{CapacityChangeEvent, GossipEvent};

        let h = harness(1);
        let original_desc = h.replica.desc();
        h.replica.handle_replicated_eval_result(
            ReplicatedEvalResult {
                delta: MvccStatsDelta {
                    live_bytes: 100,
                    key_bytes: 60,
                    val_bytes: 40,
                    key_count: 10,
                    ..Default::default()
                },
                ..Default::default()
            },
            1,
            1,
        );

        let mut left_desc = original_desc.clone();
        left_desc.end_key = b"m".to_vec();
        let mut right_desc = original_desc.clone();
        right_desc.range_id = 2;
        right_desc.start_key = b"m".to_vec();
        let rhs_delta = MvccStatsDelta {
            live_bytes: 30,
            key_bytes: 20,
            val_bytes: 10,
            key_count: 4,
            contains_estimates: true,
            ..Default::default()
        };

        let should_assert = h.replica.handle_replicated_eval_result(
            ReplicatedEvalResult {
                split: Some(SplitTrigger {
                    left_desc: left_desc.clone(),
                    right_desc: right_desc.clone(),
                    rhs_delta,
                }),
                ..Default::default()
            },
            2,
            2,
        );
        assert!(should_assert, "splits are nontrivial");

        let rhs = h.store.replica(2).expect("right-hand replica registered");
        assert_eq!(h.replica.desc(), left_desc);
        assert_eq!(rhs.desc(), right_desc);
        assert_eq!(rhs.stats(), rhs_delta.to_stats());
        assert_eq!(h.replica.stats().live_bytes, 70);
        assert!(h
            .gossip
            .events()
            .contains(&GossipEvent::Capacity(CapacityChangeEvent::RangeAdd)));

        // Merging the right-hand side back restores the original picture.
        let should_assert = h.replica.handle_replicated_eval_result(
            ReplicatedEvalResult {
                merge: Some(MergeTrigger {
                    left_desc: original_desc.clone(),
                    right_desc: right_desc.clone(),
                    freeze_start: Timestamp {
                        wall_nanos: 77,
                        logical: 0,
                    },
                }),
                ..Default::default()
            },
            3,
            3,
        );
        assert!(should_assert, "merges are nontrivial");
        assert!(h.store.replica(2).is_none());
        assert_eq!(h.replica.desc(), original_desc);
        assert_eq!(h.replica.stats().live_bytes, 100);
        assert!(h.replica.stats().contains_estimates);
        assert!(!rhs.txn_wait_queue.is_enabled());
    }

    #[test]
    #[should_panic(expected = "failed to update store after merging range")]
    fn merge_apply_failure_is_fatal() {
        let h = harness(1);
        // No right-hand replica registered: the merge cannot be applied and
        // the store has already diverged.
        let res = ReplicatedEvalResult {
            merge: Some(MergeTrigger {
                left_desc: h.replica.desc(),
                right_desc: RangeDescriptor {
                    range_id: 99,
                    ..Default::default()
                },
                freeze_start: Timestamp::zero(),
            }),
            ..Default::default()
        };
        h.replica.handle_replicated_eval_result(res, 0, 0);
    }

    #[test]
    fn applied_state_key_migration_is_idempotent() {
        let h = harness(1);
        let migrate = || ReplicatedEvalResult {
            state: Some(ReplicaStateDelta {
                using_applied_state_key: true,
                ..Default::default()
            }),
            ..Default::default()
        };

        let should_assert = h.replica.handle_replicated_eval_result(migrate(), 0, 0);
        assert!(should_assert, "first migration is nontrivial");
        {
            let mu = h.replica.mu.lock().expect("mutex");
            assert!(mu.state.using_applied_state_key);
        }

        // Re-sending the flag is a no-op and must not demand an assertion.
        let should_assert = h.replica.handle_replicated_eval_result(migrate(), 0, 0);
        assert!(!should_assert, "repeated migration flags are trivial");
    }
}
