//! Consistency checksums: hashing a replica's state at a fixed applied
//! index.
//!
//! The leaseholder commands every replica to hash its range at a common
//! applied index; a collector then compares the digests. The compute
//! command and the collector race, so both sides rendezvous through an
//! entry in the replica's checksum map: whoever arrives first creates the
//! entry, and the computation's completion fires its notifier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha512};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::command::{ChecksumMode, ComputeChecksum};
use crate::engine::EngineSnapshot;
use crate::replica::{prefix_end, range_local_prefix, Replica};
use crate::types::RangeDescriptor;

/// Version of the checksum computation. A compute command carrying a
/// different version aborts deterministically on every replica.
pub const REPLICA_CHECKSUM_VERSION: u32 = 4;

/// The outcome of one checksum computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumResult {
    /// SHA-512 over the hashed key space.
    pub digest: Vec<u8>,
    /// Raw key/value data captured alongside the digest when the command
    /// asked for it.
    pub snapshot: Option<Vec<(Vec<u8>, Vec<u8>)>>,
}

/// One tracked checksum computation, keyed by its id in the replica's map.
pub struct ReplicaChecksum {
    /// Whether the compute command has applied. A second apply with the
    /// same id is a fatal replay.
    pub started: bool,
    /// Rendezvous with the collector; fired when the result lands.
    pub notify: Arc<Notify>,
    pub checksum: Option<ChecksumResult>,
    /// Set once the computation finished; the entry is dropped after it
    /// passes.
    pub gc_deadline: Option<Instant>,
}

impl Replica {
    fn gc_old_checksum_entries_locked(
        checksums: &mut std::collections::HashMap<Uuid, ReplicaChecksum>,
        now: Instant,
    ) {
        // The deadline is meaningful only once set.
        checksums.retain(|_, entry| entry.gc_deadline.map_or(true, |deadline| now < deadline));
    }

    /// Handle an applied compute-checksum command. The caller holds the
    /// raft mutex, which is what makes the engine snapshot taken here
    /// raft-consistent.
    pub fn compute_checksum_post_apply(&self, cc: ComputeChecksum) {
        let store = self.store();
        let now = Instant::now();

        let (desc, applied_index) = {
            let mut mu = self.mu.lock().expect("replica mutex poisoned");
            let notify = match mu.checksums.get(&cc.checksum_id) {
                // No record of this id; make a fresh notifier.
                None => Arc::new(Notify::new()),
                // A collector is already waiting on this notifier.
                Some(entry) if !entry.started => entry.notify.clone(),
                Some(_) => panic!(
                    "attempted to apply compute-checksum command with duplicated checksum id {}",
                    cc.checksum_id
                ),
            };

            Self::gc_old_checksum_entries_locked(&mut mu.checksums, now);

            mu.checksums.insert(
                cc.checksum_id,
                ReplicaChecksum {
                    started: true,
                    notify,
                    checksum: None,
                    gc_deadline: None,
                },
            );
            (mu.state.desc.clone(), mu.state.raft_applied_index)
        };

        if cc.version != REPLICA_CHECKSUM_VERSION {
            // Tell the collector that no result is coming.
            self.compute_checksum_done(cc.checksum_id, None);
            tracing::info!(
                requested = cc.version,
                have = REPLICA_CHECKSUM_VERSION,
                "incompatible compute-checksum versions"
            );
            return;
        }

        // The raft mutex is held by the caller, so this snapshot cannot see
        // a command mid-apply.
        let snapshot = self.engine().new_snapshot();

        if cc.checkpoint {
            let base = self.engine().auxiliary_dir().join("checkpoints");
            // The name matches on every replica, which is what makes a
            // divergence reproducible from the checkpoints alone.
            let dir = base.join(format!("r{}_at_{}", self.range_id(), applied_index));
            match self.engine().create_checkpoint(&dir) {
                Ok(()) => tracing::info!(dir = %dir.display(), "created checkpoint"),
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = ?err, "unable to create checkpoint")
                }
            }
        }

        // Compute the digest asynchronously and deliver it through the map.
        let task = {
            let this = match store.replica(self.range_id()) {
                Some(this) => this,
                None => {
                    // Unregistered replica: nothing can own the async task,
                    // so record the abort synchronously.
                    tracing::warn!(
                        range_id = self.range_id(),
                        "replica not registered with its store; aborting checksum computation"
                    );
                    self.compute_checksum_done(cc.checksum_id, None);
                    return;
                }
            };
            let checksum_id = cc.checksum_id;
            let mode = cc.mode;
            let save_snapshot = cc.save_snapshot;
            async move {
                let result =
                    match sha512(&desc, snapshot.as_ref(), mode, save_snapshot) {
                        Ok(result) => Some(result),
                        Err(err) => {
                            tracing::error!(error = ?err, "checksum computation failed");
                            None
                        }
                    };
                this.compute_checksum_done(checksum_id, result);
            }
        };
        if let Err(err) = store
            .stopper()
            .run_async_task("replica: computing checksum", task)
        {
            tracing::error!(
                error = ?err,
                checksum_id = %cc.checksum_id,
                "could not run async checksum computation"
            );
            self.compute_checksum_done(cc.checksum_id, None);
        }
    }

    /// Record the outcome of a checksum computation and wake the collector.
    /// A `None` result tells the collector that no digest is coming.
    pub fn compute_checksum_done(&self, id: Uuid, result: Option<ChecksumResult>) {
        let gc_interval = self.store().cfg().checksum_gc_interval;
        let mut mu = self.mu.lock().expect("replica mutex poisoned");
        match mu.checksums.get_mut(&id) {
            Some(entry) => {
                entry.checksum = result;
                entry.gc_deadline = Some(Instant::now() + gc_interval);
                entry.notify.notify_one();
            }
            None => {
                // The entry was GCed out from under the computation; the
                // collector will time out on its own.
                tracing::warn!(checksum_id = %id, "no checksum entry found to store result");
            }
        }
    }

    /// Collector side: wait until the computation with `id` completes and
    /// return its result. Registers the rendezvous entry if the compute
    /// command has not applied yet.
    pub async fn get_checksum(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> anyhow::Result<Option<ChecksumResult>> {
        let notify = {
            let mut mu = self.mu.lock().expect("replica mutex poisoned");
            let entry = mu.checksums.entry(id).or_insert_with(|| ReplicaChecksum {
                started: false,
                notify: Arc::new(Notify::new()),
                checksum: None,
                gc_deadline: None,
            });
            if entry.gc_deadline.is_some() {
                // Already finished (possibly with an abort).
                return Ok(entry.checksum.clone());
            }
            entry.notify.clone()
        };

        tokio::time::timeout(timeout, notify.notified())
            .await
            .map_err(|_| anyhow::anyhow!("checksum computation {id} did not complete in time"))?;

        let mu = self.mu.lock().expect("replica mutex poisoned");
        Ok(mu.checksums.get(&id).and_then(|entry| entry.checksum.clone()))
    }
}

/// SHA-512 over the replica's key space at the snapshot. Always covers the
/// range-local records; `Full` mode covers the user key span as well.
fn sha512(
    desc: &RangeDescriptor,
    snapshot: &dyn EngineSnapshot,
    mode: ChecksumMode,
    save_snapshot: bool,
) -> anyhow::Result<ChecksumResult> {
    let mut hasher = Sha512::new();
    let mut saved = if save_snapshot { Some(Vec::new()) } else { None };

    let local_prefix = range_local_prefix(desc.range_id);
    let mut spans = vec![(local_prefix.clone(), prefix_end(&local_prefix))];
    if mode == ChecksumMode::Full {
        spans.push((desc.start_key.clone(), desc.end_key.clone()));
    }

    for (start, end) in spans {
        for (key, value) in snapshot.scan(&start, &end) {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(&key);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(&value);
            if let Some(saved) = saved.as_mut() {
                saved.push((key, value));
            }
        }
    }

    Ok(ChecksumResult {
        digest: hasher.finalize().to_vec(),
        snapshot: saved,
    })
}
