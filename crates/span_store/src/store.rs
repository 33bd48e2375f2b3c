//! The store: everything replicas on one node share.
//!
//! The proposal pipeline reaches the store for its background queues, the
//! compactor, gossip, the timestamp cache, the renewable-leases registry,
//! and metrics. All of these expose non-blocking entry points; the apply
//! path must never wait on a collaborator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::command::{MergeTrigger, SplitTrigger, SuggestedCompaction};
use crate::engine::Engine;
use crate::hlc::{Clock, Timestamp};
use crate::replica::Replica;
use crate::result::MetricsDelta;
use crate::stats::MvccStatsDelta;
use crate::types::{KeySpan, NodeId, RangeId, StoreId, TxnMeta};

/// Key span under which node liveness records live. Handed to gossip when a
/// leaseholder re-gossips liveness.
pub fn node_liveness_span() -> KeySpan {
    KeySpan::new(&b"\x01liveness-"[..], &b"\x01liveness."[..])
}

/// Cluster-version feature gates consulted by the pipeline.
#[derive(Clone, Copy, Debug)]
pub struct VersionGates {
    /// Commands carry an incremental stats delta instead of the full
    /// embedded stats struct.
    pub mvcc_network_stats: bool,
    /// Replicas may migrate to the combined applied-state record.
    pub range_applied_state_key: bool,
    /// Ingested SSTables will never be read by an engine that needs global
    /// sequence-number rewrites.
    pub unreplicated_truncated_state: bool,
}

impl Default for VersionGates {
    fn default() -> Self {
        Self {
            mvcc_network_stats: true,
            range_applied_state_key: true,
            unreplicated_truncated_state: true,
        }
    }
}

/// Store configuration. Defaults fit tests and small deployments; the
/// `SPAN_STORE_*` environment knobs override individual values.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub node_id: NodeId,
    pub store_id: StoreId,
    /// Unreported raft-log growth that triggers a raft-log-queue check.
    pub raft_log_queue_stale_size: i64,
    /// Size above which a range is enqueued for splitting.
    pub range_max_bytes: i64,
    /// Size below which a range is enqueued for merging.
    pub range_min_bytes: i64,
    pub split_queue_throttle: Duration,
    pub merge_queue_throttle: Duration,
    pub lease_history_capacity: usize,
    /// How long a finished checksum entry lingers for late collectors.
    pub checksum_gc_interval: Duration,
    /// Sync cadence of the SSTable copy writer.
    pub sst_bytes_per_sync: usize,
    pub versions: VersionGates,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            store_id: 1,
            raft_log_queue_stale_size: 64 << 10,
            range_max_bytes: 512 << 20,
            range_min_bytes: 16 << 20,
            split_queue_throttle: Duration::from_secs(2),
            merge_queue_throttle: Duration::from_secs(5),
            lease_history_capacity: 100,
            checksum_gc_interval: Duration::from_secs(3600),
            sst_bytes_per_sync: 512 << 10,
            versions: VersionGates::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.raft_log_queue_stale_size = read_env_i64(
            "SPAN_STORE_RAFT_LOG_QUEUE_STALE_SIZE",
            cfg.raft_log_queue_stale_size,
        );
        cfg.range_max_bytes = read_env_i64("SPAN_STORE_RANGE_MAX_BYTES", cfg.range_max_bytes);
        cfg.range_min_bytes = read_env_i64("SPAN_STORE_RANGE_MIN_BYTES", cfg.range_min_bytes);
        cfg.sst_bytes_per_sync =
            read_env_i64("SPAN_STORE_SST_BYTES_PER_SYNC", cfg.sst_bytes_per_sync as i64).max(1)
                as usize;
        cfg
    }
}

fn read_env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| i64::from_str(&v).ok())
        .unwrap_or(default)
}

/// Events that may change the capacity picture gossiped for this store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityChangeEvent {
    LeaseAdd,
    LeaseRemove,
    RangeAdd,
    RangeRemove,
}

/// Gossip hooks the pipeline fires. The real implementation talks to the
/// cluster gossip network; tests record.
pub trait Gossip: Send + Sync + 'static {
    fn gossip_first_range(&self, range_id: RangeId);
    fn maybe_gossip_system_config(&self) -> anyhow::Result<()>;
    fn maybe_gossip_node_liveness(&self, span: &KeySpan) -> anyhow::Result<()>;
    fn maybe_gossip_on_capacity_change(&self, event: CapacityChangeEvent);
}

/// Gossip sink that drops everything.
pub struct NoopGossip;

impl Gossip for NoopGossip {
    fn gossip_first_range(&self, _range_id: RangeId) {}
    fn maybe_gossip_system_config(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn maybe_gossip_node_liveness(&self, _span: &KeySpan) -> anyhow::Result<()> {
        Ok(())
    }
    fn maybe_gossip_on_capacity_change(&self, _event: CapacityChangeEvent) {}
}

#[derive(Clone, Debug, PartialEq)]
pub enum GossipEvent {
    FirstRange(RangeId),
    SystemConfig,
    NodeLiveness(KeySpan),
    Capacity(CapacityChangeEvent),
}

/// Gossip sink that records every event, for tests.
#[derive(Default)]
pub struct RecordingGossip {
    events: Mutex<Vec<GossipEvent>>,
}

impl RecordingGossip {
    pub fn events(&self) -> Vec<GossipEvent> {
        self.events.lock().expect("gossip mutex poisoned").clone()
    }

    fn record(&self, event: GossipEvent) {
        self.events.lock().expect("gossip mutex poisoned").push(event);
    }
}

impl Gossip for RecordingGossip {
    fn gossip_first_range(&self, range_id: RangeId) {
        self.record(GossipEvent::FirstRange(range_id));
    }
    fn maybe_gossip_system_config(&self) -> anyhow::Result<()> {
        self.record(GossipEvent::SystemConfig);
        Ok(())
    }
    fn maybe_gossip_node_liveness(&self, span: &KeySpan) -> anyhow::Result<()> {
        self.record(GossipEvent::NodeLiveness(span.clone()));
        Ok(())
    }
    fn maybe_gossip_on_capacity_change(&self, event: CapacityChangeEvent) {
        self.record(GossipEvent::Capacity(event));
    }
}

/// A background processing queue. Enqueueing never blocks; the processing
/// loop drains `take_pending` on its own schedule.
pub struct RangeQueue {
    name: &'static str,
    pending: Mutex<Vec<(RangeId, Timestamp)>>,
}

impl RangeQueue {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn maybe_add_async(&self, range_id: RangeId, now: Timestamp) {
        tracing::debug!(queue = self.name, range_id, "queueing range");
        self.pending
            .lock()
            .expect("queue mutex poisoned")
            .push((range_id, now));
    }

    pub fn pending(&self) -> Vec<(RangeId, Timestamp)> {
        self.pending.lock().expect("queue mutex poisoned").clone()
    }

    pub fn take_pending(&self) -> Vec<(RangeId, Timestamp)> {
        std::mem::take(&mut *self.pending.lock().expect("queue mutex poisoned"))
    }
}

/// Collects compaction suggestions emitted at apply time.
#[derive(Default)]
pub struct Compactor {
    suggestions: Mutex<Vec<SuggestedCompaction>>,
}

impl Compactor {
    pub fn suggest(&self, sc: SuggestedCompaction) {
        self.suggestions
            .lock()
            .expect("compactor mutex poisoned")
            .push(sc);
    }

    pub fn take_suggestions(&self) -> Vec<SuggestedCompaction> {
        std::mem::take(&mut *self.suggestions.lock().expect("compactor mutex poisoned"))
    }
}

/// Cache of raft log entries by index, cleared on truncation.
#[derive(Default)]
pub struct RaftEntryCache {
    entries: Mutex<HashMap<RangeId, BTreeMap<u64, usize>>>,
}

impl RaftEntryCache {
    pub fn add(&self, range_id: RangeId, index: u64, size: usize) {
        self.entries
            .lock()
            .expect("entry cache mutex poisoned")
            .entry(range_id)
            .or_default()
            .insert(index, size);
    }

    /// Drop cached entries for `range_id` with index below `up_to`.
    pub fn clear(&self, range_id: RangeId, up_to: u64) {
        let mut entries = self.entries.lock().expect("entry cache mutex poisoned");
        if let Some(cached) = entries.get_mut(&range_id) {
            *cached = cached.split_off(&up_to);
        }
    }

    pub fn len(&self, range_id: RangeId) -> usize {
        self.entries
            .lock()
            .expect("entry cache mutex poisoned")
            .get(&range_id)
            .map_or(0, |c| c.len())
    }
}

/// Read-timestamp low-water marks per range. Advancing the mark on lease
/// acquisition is what protects the new leaseholder from serving below
/// timestamps the old one already promised.
#[derive(Default)]
pub struct TimestampCache {
    low_water: Mutex<HashMap<RangeId, Timestamp>>,
}

impl TimestampCache {
    pub fn set_low_water(&self, range_id: RangeId, ts: Timestamp) {
        let mut low_water = self.low_water.lock().expect("ts cache mutex poisoned");
        low_water.entry(range_id).or_default().forward(ts);
    }

    pub fn low_water(&self, range_id: RangeId) -> Timestamp {
        self.low_water
            .lock()
            .expect("ts cache mutex poisoned")
            .get(&range_id)
            .copied()
            .unwrap_or_default()
    }
}

/// Queue of transactions pushed on this range, waiting for their blockers.
/// Only the leaseholder runs it; losing the lease clears and disables it so
/// waiters redirect to the new holder.
#[derive(Default)]
pub struct TxnWaitQueue {
    enabled: AtomicBool,
    txns: Mutex<HashMap<Uuid, TxnMeta>>,
}

impl TxnWaitQueue {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn clear(&self, disable: bool) {
        if disable {
            self.enabled.store(false, Ordering::Release);
        }
        self.txns.lock().expect("txn wait mutex poisoned").clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn update_txn(&self, txn: TxnMeta) {
        if !self.is_enabled() {
            return;
        }
        self.txns
            .lock()
            .expect("txn wait mutex poisoned")
            .insert(txn.id, txn);
    }

    pub fn tracked(&self) -> usize {
        self.txns.lock().expect("txn wait mutex poisoned").len()
    }
}

/// Rate guard for queue enqueues: at most one pass per interval.
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_process(&self, now: Instant) -> bool {
        let mut last = self.last.lock().expect("throttle mutex poisoned");
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Gate for asynchronous work. Task submission fails once draining has
/// begun or when no runtime is available, and callers are expected to
/// degrade gracefully (the checksum scheduler completes with a nil result).
#[derive(Default)]
pub struct Stopper {
    draining: AtomicBool,
}

impl Stopper {
    pub fn run_async_task<F>(&self, name: &'static str, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        anyhow::ensure!(!self.is_draining(), "stopper is draining ({name})");
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| anyhow::anyhow!("no runtime available for async task ({name})"))?;
        handle.spawn(fut);
        Ok(())
    }

    pub fn stop(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

/// Store-level metric counters. Lock-free so the apply path can publish
/// without contention.
#[derive(Default)]
pub struct StoreMetrics {
    live_bytes: AtomicI64,
    key_bytes: AtomicI64,
    val_bytes: AtomicI64,
    sys_bytes: AtomicI64,
    intent_count: AtomicI64,
    lease_request_success: AtomicI64,
    lease_request_error: AtomicI64,
    lease_transfer_success: AtomicI64,
    lease_transfer_error: AtomicI64,
    raft_leadership_transfers: AtomicU64,
    sst_ingests: AtomicU64,
    sst_ingest_copies: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub live_bytes: i64,
    pub key_bytes: i64,
    pub val_bytes: i64,
    pub sys_bytes: i64,
    pub intent_count: i64,
    pub lease_request_success: i64,
    pub lease_request_error: i64,
    pub lease_transfer_success: i64,
    pub lease_transfer_error: i64,
    pub raft_leadership_transfers: u64,
    pub sst_ingests: u64,
    pub sst_ingest_copies: u64,
}

impl StoreMetrics {
    pub fn add_mvcc_stats(&self, delta: MvccStatsDelta) {
        self.live_bytes.fetch_add(delta.live_bytes, Ordering::Relaxed);
        self.key_bytes.fetch_add(delta.key_bytes, Ordering::Relaxed);
        self.val_bytes.fetch_add(delta.val_bytes, Ordering::Relaxed);
        self.sys_bytes.fetch_add(delta.sys_bytes, Ordering::Relaxed);
        self.intent_count
            .fetch_add(delta.intent_count, Ordering::Relaxed);
    }

    pub fn handle_metrics_result(&self, delta: MetricsDelta) {
        self.lease_request_success
            .fetch_add(delta.lease_request_success, Ordering::Relaxed);
        self.lease_request_error
            .fetch_add(delta.lease_request_error, Ordering::Relaxed);
        self.lease_transfer_success
            .fetch_add(delta.lease_transfer_success, Ordering::Relaxed);
        self.lease_transfer_error
            .fetch_add(delta.lease_transfer_error, Ordering::Relaxed);
    }

    pub fn record_raft_leadership_transfer(&self) {
        self.raft_leadership_transfers
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sst_ingest(&self, copied: bool) {
        self.sst_ingests.fetch_add(1, Ordering::Relaxed);
        if copied {
            self.sst_ingest_copies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            key_bytes: self.key_bytes.load(Ordering::Relaxed),
            val_bytes: self.val_bytes.load(Ordering::Relaxed),
            sys_bytes: self.sys_bytes.load(Ordering::Relaxed),
            intent_count: self.intent_count.load(Ordering::Relaxed),
            lease_request_success: self.lease_request_success.load(Ordering::Relaxed),
            lease_request_error: self.lease_request_error.load(Ordering::Relaxed),
            lease_transfer_success: self.lease_transfer_success.load(Ordering::Relaxed),
            lease_transfer_error: self.lease_transfer_error.load(Ordering::Relaxed),
            raft_leadership_transfers: self.raft_leadership_transfers.load(Ordering::Relaxed),
            sst_ingests: self.sst_ingests.load(Ordering::Relaxed),
            sst_ingest_copies: self.sst_ingest_copies.load(Ordering::Relaxed),
        }
    }
}

/// One node-local store holding a set of replicas over a shared engine.
pub struct Store {
    cfg: StoreConfig,
    clock: Arc<Clock>,
    engine: Arc<dyn Engine>,
    gossip: Arc<dyn Gossip>,
    pub ts_cache: TimestampCache,
    pub split_queue: RangeQueue,
    pub merge_queue: RangeQueue,
    pub raft_log_queue: RangeQueue,
    pub replica_gc_queue: RangeQueue,
    pub compactor: Compactor,
    pub raft_entry_cache: RaftEntryCache,
    pub metrics: StoreMetrics,
    stopper: Stopper,
    replicas: Mutex<HashMap<RangeId, Arc<Replica>>>,
    renewable_leases: Mutex<HashSet<RangeId>>,
    renewable_leases_signal: mpsc::Sender<()>,
    renewable_leases_signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    lease_applied_hints: Mutex<HashMap<RangeId, u64>>,
    weak_self: Weak<Store>,
}

impl Store {
    pub fn new(
        cfg: StoreConfig,
        clock: Arc<Clock>,
        engine: Arc<dyn Engine>,
        gossip: Arc<dyn Gossip>,
    ) -> Arc<Store> {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Arc::new_cyclic(|weak| Store {
            cfg,
            clock,
            engine,
            gossip,
            ts_cache: TimestampCache::default(),
            split_queue: RangeQueue::new("split"),
            merge_queue: RangeQueue::new("merge"),
            raft_log_queue: RangeQueue::new("raftlog"),
            replica_gc_queue: RangeQueue::new("replicaGC"),
            compactor: Compactor::default(),
            raft_entry_cache: RaftEntryCache::default(),
            metrics: StoreMetrics::default(),
            stopper: Stopper::default(),
            replicas: Mutex::new(HashMap::new()),
            renewable_leases: Mutex::new(HashSet::new()),
            renewable_leases_signal: signal_tx,
            renewable_leases_signal_rx: Mutex::new(Some(signal_rx)),
            lease_applied_hints: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    pub fn cfg(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn gossip(&self) -> &Arc<dyn Gossip> {
        &self.gossip
    }

    pub fn store_id(&self) -> StoreId {
        self.cfg.store_id
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn add_replica(&self, replica: Arc<Replica>) {
        self.replicas
            .lock()
            .expect("replica map mutex poisoned")
            .insert(replica.range_id(), replica);
    }

    pub fn replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas
            .lock()
            .expect("replica map mutex poisoned")
            .get(&range_id)
            .cloned()
    }

    pub fn remove_replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas
            .lock()
            .expect("replica map mutex poisoned")
            .remove(&range_id)
    }

    pub fn maybe_gossip_on_capacity_change(&self, event: CapacityChangeEvent) {
        self.gossip.maybe_gossip_on_capacity_change(event);
    }

    /// Register a range whose expiration-based lease needs proactive
    /// renewal, and nudge the renewer. The nudge never blocks: if the
    /// renewer is already awake the signal is dropped.
    pub(crate) fn register_renewable_lease(&self, range_id: RangeId) {
        self.renewable_leases
            .lock()
            .expect("renewable leases mutex poisoned")
            .insert(range_id);
        let _ = self.renewable_leases_signal.try_send(());
    }

    pub fn renewable_leases(&self) -> Vec<RangeId> {
        let mut leases: Vec<RangeId> = self
            .renewable_leases
            .lock()
            .expect("renewable leases mutex poisoned")
            .iter()
            .copied()
            .collect();
        leases.sort_unstable();
        leases
    }

    /// Hand the renewal signal receiver to the renewer worker. Returns
    /// `None` after the first call.
    pub fn take_renewal_signal(&self) -> Option<mpsc::Receiver<()>> {
        self.renewable_leases_signal_rx
            .lock()
            .expect("renewal signal mutex poisoned")
            .take()
    }

    /// Record the highest lease-applied index seen for a range; followers
    /// read the hint instead of asking the leaseholder.
    pub fn record_lease_applied_hint(&self, range_id: RangeId, index: u64) {
        let mut hints = self
            .lease_applied_hints
            .lock()
            .expect("lease hint mutex poisoned");
        let entry = hints.entry(range_id).or_default();
        if index > *entry {
            *entry = index;
        }
    }

    pub fn lease_applied_hint(&self, range_id: RangeId) -> Option<u64> {
        self.lease_applied_hints
            .lock()
            .expect("lease hint mutex poisoned")
            .get(&range_id)
            .copied()
    }

    /// Split the left-hand replica: install the narrowed descriptor, carve
    /// the right-hand stats out, and bring up the right-hand replica with
    /// the same lease. Runs after the command's stats delta has been added
    /// because the carved-out stats may contain estimates.
    pub(crate) fn split_post_apply(&self, lhs: &Replica, split: &SplitTrigger) {
        let this = self
            .weak_self
            .upgrade()
            .expect("store dropped during split application");

        {
            let mut mu = lhs.mu.lock().expect("replica mutex poisoned");
            mu.state.stats.subtract(split.rhs_delta);
            mu.state.desc = split.left_desc.clone();
        }
        lhs.persist_state();

        let rhs_id = split.right_desc.range_id;
        let rhs = match self.replica(rhs_id) {
            Some(existing) => existing,
            None => {
                let replica_id = split
                    .right_desc
                    .replica_on_store(self.store_id())
                    .map(|r| r.replica_id)
                    .unwrap_or(0);
                let rhs = Replica::new(
                    &this,
                    split.right_desc.clone(),
                    replica_id,
                    lhs.engine().clone(),
                    lhs.sideloaded.clone(),
                    lhs.evaluator().clone(),
                );
                self.add_replica(rhs.clone());
                rhs
            }
        };

        {
            let mut mu = rhs.mu.lock().expect("replica mutex poisoned");
            mu.state.desc = split.right_desc.clone();
            mu.state.stats = split.rhs_delta.to_stats();
        }
        // The right-hand side starts out under the left-hand lease at an
        // unchanged sequence number, which the same-sequence equivalency
        // rule permits.
        let lease = {
            lhs.mu
                .lock()
                .expect("replica mutex poisoned")
                .state
                .lease
                .clone()
        };
        rhs.lease_post_apply(&lease, false);
        rhs.persist_state();

        self.maybe_gossip_on_capacity_change(CapacityChangeEvent::RangeAdd);
        tracing::info!(
            left_range_id = split.left_desc.range_id,
            right_range_id = rhs_id,
            split_key = %String::from_utf8_lossy(&split.right_desc.start_key),
            "applied range split"
        );
    }

    /// Subsume the right-hand range into the left. Failure here is fatal at
    /// the caller: the on-disk state already committed to the merge.
    pub(crate) fn merge_range(&self, lhs: &Replica, merge: &MergeTrigger) -> anyhow::Result<()> {
        let rhs = self.replica(merge.right_desc.range_id).ok_or_else(|| {
            anyhow::anyhow!(
                "merge apply: right-hand replica of r{} not found on this store",
                merge.right_desc.range_id
            )
        })?;

        let rhs_stats = {
            rhs.mu
                .lock()
                .expect("replica mutex poisoned")
                .state
                .stats
        };
        self.remove_replica(merge.right_desc.range_id);
        rhs.txn_wait_queue.clear(true);

        {
            let mut mu = lhs.mu.lock().expect("replica mutex poisoned");
            mu.state.stats.add(rhs_stats.to_delta());
            mu.state.desc = merge.left_desc.clone();
        }
        lhs.persist_state();

        self.maybe_gossip_on_capacity_change(CapacityChangeEvent::RangeRemove);
        tracing::info!(
            left_range_id = merge.left_desc.range_id,
            right_range_id = merge.right_desc.range_id,
            freeze_start = %merge.freeze_start,
            "applied range merge"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_admits_first_and_spaced_calls() {
        let throttle = Throttle::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(throttle.should_process(t0));
        assert!(!throttle.should_process(t0 + Duration::from_secs(1)));
        assert!(throttle.should_process(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn entry_cache_clear_drops_only_older_indexes() {
        let cache = RaftEntryCache::default();
        for index in 1..=10 {
            cache.add(3, index, 100);
        }
        cache.clear(3, 6);
        assert_eq!(cache.len(3), 5);
    }

    #[test]
    fn ts_cache_low_water_is_monotonic() {
        let cache = TimestampCache::default();
        cache.set_low_water(
            1,
            Timestamp {
                wall_nanos: 50,
                logical: 0,
            },
        );
        cache.set_low_water(
            1,
            Timestamp {
                wall_nanos: 20,
                logical: 0,
            },
        );
        assert_eq!(cache.low_water(1).wall_nanos, 50);
    }

    #[test]
    fn renewal_signal_never_blocks() {
        let store = Store::new(
            StoreConfig::default(),
            Arc::new(Clock::new(Duration::from_millis(500))),
            Arc::new(crate::engine::InMemEngine::new()),
            Arc::new(NoopGossip),
        );
        // No receiver draining; the second signal hits a full channel and is
        // dropped rather than blocking the caller.
        store.register_renewable_lease(1);
        store.register_renewable_lease(2);
        store.register_renewable_lease(3);
        assert_eq!(store.renewable_leases(), vec![1, 2, 3]);

        let mut rx = store.take_renewal_signal().expect("receiver");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
