//! The replicated command wire model.
//!
//! A [`RaftCommand`] is the unit of work that goes through the consensus
//! log: the serialized write batch plus a [`ReplicatedEvalResult`] describing
//! every side effect the command carries. The eval result doubles as a
//! checklist; the applier clears each field as it processes it and a
//! residual non-zero field at the end of application is a fatal bug, so the
//! struct derives `PartialEq` against its `Default`.
//!
//! Everything here encodes to a hand-rolled big-endian format with explicit
//! presence bytes for optional fields. The encoding is canonical: all
//! replicas decode the same bytes into the same command.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hlc::Timestamp;
use crate::lease::Lease;
use crate::stats::{MvccStats, MvccStatsDelta};
use crate::types::{KeySpan, RangeDescriptor, ReplicaDescriptor};

/// One engine mutation inside a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

const BATCH_OP_PUT: u8 = 1;
const BATCH_OP_DELETE: u8 = 2;

/// The serialized representation of a command's effect on the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub data: Bytes,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn decode(&self) -> anyhow::Result<Vec<BatchOp>> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        let data = &self.data;
        let mut offset = 0usize;
        let count = read_u32(data, &mut offset)? as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            match read_u8(data, &mut offset)? {
                BATCH_OP_PUT => {
                    let key = read_bytes(data, &mut offset)?;
                    let value = read_bytes(data, &mut offset)?;
                    ops.push(BatchOp::Put { key, value });
                }
                BATCH_OP_DELETE => {
                    let key = read_bytes(data, &mut offset)?;
                    ops.push(BatchOp::Delete { key });
                }
                other => anyhow::bail!("unknown write batch op tag {other}"),
            }
        }
        Ok(ops)
    }
}

/// Accumulates engine mutations during evaluation and seals them into a
/// [`WriteBatch`].
#[derive(Default)]
pub struct WriteBatchBuilder {
    ops: Vec<BatchOp>,
}

impl WriteBatchBuilder {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn finish(self) -> WriteBatch {
        if self.ops.is_empty() {
            return WriteBatch::default();
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(self.ops.len() as u32).to_be_bytes());
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    out.push(BATCH_OP_PUT);
                    put_bytes(&mut out, key);
                    put_bytes(&mut out, value);
                }
                BatchOp::Delete { key } => {
                    out.push(BATCH_OP_DELETE);
                    put_bytes(&mut out, key);
                }
            }
        }
        WriteBatch { data: out.into() }
    }
}

/// Raft log truncation point: everything at or below `index` is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Replicated instruction to split a range in two.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
    /// Stats carved out for the right-hand side. May contain estimates,
    /// which is why splits are processed after the command's stats delta.
    pub rhs_delta: MvccStatsDelta,
}

/// Replicated instruction to subsume the right-hand range into the left.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
    /// Timestamp at which the right-hand side stopped serving traffic.
    pub freeze_start: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaChangeType {
    AddReplica,
    RemoveReplica,
}

/// Replicated replica-set change. Applied everywhere; only the store losing
/// its replica acts on it locally.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeReplicas {
    pub change_type: ReplicaChangeType,
    pub replica: ReplicaDescriptor,
}

/// How much state a consistency checksum covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Range-local (system) keys only.
    Fast,
    /// The whole replicated key space of the range.
    Full,
}

/// Replicated instruction to hash the range's state at this applied index.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputeChecksum {
    pub checksum_id: Uuid,
    /// Checksum algorithm version; replicas at a different version abort
    /// the computation deterministically.
    pub version: u32,
    pub mode: ChecksumMode,
    /// Capture the raw key/value data alongside the digest for debugging.
    pub save_snapshot: bool,
    /// Write an engine checkpoint named identically on all replicas.
    pub checkpoint: bool,
}

/// Hint forwarded to the store's compactor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SuggestedCompaction {
    pub span: KeySpan,
    pub bytes: i64,
}

/// A sideloaded SSTable to ingest before the command's write batch applies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddSstable {
    pub data: Bytes,
    pub crc32: u32,
}

/// Changes to the replica's durable state sub-fields. Each is optional and
/// cleared individually by the applier; when every field is consumed the
/// whole struct resets to its zero value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaStateDelta {
    pub truncated_state: Option<TruncatedState>,
    /// Full-stats carrier emitted by proposers that predate incremental
    /// deltas. A decoded zero value is dropped without action.
    pub stats: Option<MvccStats>,
    /// One-time migration flag switching the replica to the combined
    /// applied-state record. Idempotent.
    pub using_applied_state_key: bool,
    pub desc: Option<RangeDescriptor>,
    pub lease: Option<Lease>,
    pub gc_threshold: Option<Timestamp>,
    pub txn_span_gc_threshold: Option<Timestamp>,
}

/// The replicated half of an evaluation: everything that must be applied
/// identically on every replica.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicatedEvalResult {
    pub is_lease_request: bool,
    pub timestamp: Timestamp,
    /// Proposal time of the lease this command replaces, for observability.
    pub prev_lease_proposal: Option<Timestamp>,
    /// Hold off reads for the remainder of application.
    pub block_reads: bool,
    pub delta: MvccStatsDelta,
    /// Full stats emitted instead of `delta` in mixed-version clusters.
    pub deprecated_delta: Option<MvccStats>,
    pub raft_log_delta: i64,
    pub suggested_compactions: Vec<SuggestedCompaction>,
    pub split: Option<SplitTrigger>,
    pub merge: Option<MergeTrigger>,
    pub state: Option<ReplicaStateDelta>,
    pub change_replicas: Option<ChangeReplicas>,
    pub compute_checksum: Option<ComputeChecksum>,
    pub add_sstable: Option<AddSstable>,
}

/// The full unit of replication for one proposal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RaftCommand {
    /// Highest lease-applied index this command may be applied at. The one
    /// field that changes across reproposals.
    pub max_lease_index: u64,
    pub replicated: ReplicatedEvalResult,
    pub write_batch: Option<WriteBatch>,
    /// Opaque per-command logical operation log, consumed downstream by
    /// change feeds.
    pub logical_op_log: Option<Bytes>,
}

pub fn encode_raft_command(cmd: &RaftCommand) -> Bytes {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&cmd.max_lease_index.to_be_bytes());
    encode_replicated(&mut out, &cmd.replicated);
    put_opt(&mut out, cmd.write_batch.as_ref(), |out, wb| {
        put_bytes(out, &wb.data)
    });
    put_opt(&mut out, cmd.logical_op_log.as_ref(), |out, log| {
        put_bytes(out, log)
    });
    out.into()
}

pub fn decode_raft_command(data: &[u8]) -> anyhow::Result<RaftCommand> {
    let mut offset = 0usize;
    let max_lease_index = read_u64(data, &mut offset)?;
    let replicated = decode_replicated(data, &mut offset)?;
    let write_batch = read_opt(data, &mut offset, |data, offset| {
        Ok(WriteBatch {
            data: read_bytes(data, offset)?.into(),
        })
    })?;
    let logical_op_log = read_opt(data, &mut offset, |data, offset| {
        Ok(Bytes::from(read_bytes(data, offset)?))
    })?;
    anyhow::ensure!(offset == data.len(), "trailing bytes in raft command");
    Ok(RaftCommand {
        max_lease_index,
        replicated,
        write_batch,
        logical_op_log,
    })
}

fn encode_replicated(out: &mut Vec<u8>, res: &ReplicatedEvalResult) {
    put_bool(out, res.is_lease_request);
    put_ts(out, res.timestamp);
    put_opt(out, res.prev_lease_proposal.as_ref(), |out, ts| {
        put_ts(out, *ts)
    });
    put_bool(out, res.block_reads);
    put_stats_delta(out, &res.delta);
    put_opt(out, res.deprecated_delta.as_ref(), |out, stats| {
        put_stats(out, stats)
    });
    out.extend_from_slice(&res.raft_log_delta.to_be_bytes());
    out.extend_from_slice(&(res.suggested_compactions.len() as u32).to_be_bytes());
    for sc in &res.suggested_compactions {
        put_bytes(out, &sc.span.key);
        put_bytes(out, &sc.span.end_key);
        out.extend_from_slice(&sc.bytes.to_be_bytes());
    }
    put_opt(out, res.split.as_ref(), |out, split| {
        put_desc(out, &split.left_desc);
        put_desc(out, &split.right_desc);
        put_stats_delta(out, &split.rhs_delta);
    });
    put_opt(out, res.merge.as_ref(), |out, merge| {
        put_desc(out, &merge.left_desc);
        put_desc(out, &merge.right_desc);
        put_ts(out, merge.freeze_start);
    });
    put_opt(out, res.state.as_ref(), |out, state| {
        put_opt(out, state.truncated_state.as_ref(), |out, trunc| {
            out.extend_from_slice(&trunc.index.to_be_bytes());
            out.extend_from_slice(&trunc.term.to_be_bytes());
        });
        put_opt(out, state.stats.as_ref(), |out, stats| {
            put_stats(out, stats)
        });
        put_bool(out, state.using_applied_state_key);
        put_opt(out, state.desc.as_ref(), |out, desc| put_desc(out, desc));
        put_opt(out, state.lease.as_ref(), |out, lease| {
            put_lease(out, lease)
        });
        put_opt(out, state.gc_threshold.as_ref(), |out, ts| put_ts(out, *ts));
        put_opt(out, state.txn_span_gc_threshold.as_ref(), |out, ts| {
            put_ts(out, *ts)
        });
    });
    put_opt(out, res.change_replicas.as_ref(), |out, change| {
        out.push(match change.change_type {
            ReplicaChangeType::AddReplica => 1,
            ReplicaChangeType::RemoveReplica => 2,
        });
        put_replica(out, &change.replica);
    });
    put_opt(out, res.compute_checksum.as_ref(), |out, cc| {
        out.extend_from_slice(cc.checksum_id.as_bytes());
        out.extend_from_slice(&cc.version.to_be_bytes());
        out.push(match cc.mode {
            ChecksumMode::Fast => 1,
            ChecksumMode::Full => 2,
        });
        put_bool(out, cc.save_snapshot);
        put_bool(out, cc.checkpoint);
    });
    put_opt(out, res.add_sstable.as_ref(), |out, sst| {
        put_bytes(out, &sst.data);
        out.extend_from_slice(&sst.crc32.to_be_bytes());
    });
}

fn decode_replicated(data: &[u8], offset: &mut usize) -> anyhow::Result<ReplicatedEvalResult> {
    let is_lease_request = read_bool(data, offset)?;
    let timestamp = read_ts(data, offset)?;
    let prev_lease_proposal = read_opt(data, offset, read_ts)?;
    let block_reads = read_bool(data, offset)?;
    let delta = read_stats_delta(data, offset)?;
    let deprecated_delta = read_opt(data, offset, read_stats)?;
    let raft_log_delta = read_i64(data, offset)?;
    let compaction_count = read_u32(data, offset)? as usize;
    let mut suggested_compactions = Vec::with_capacity(compaction_count);
    for _ in 0..compaction_count {
        let key = read_bytes(data, offset)?;
        let end_key = read_bytes(data, offset)?;
        let bytes = read_i64(data, offset)?;
        suggested_compactions.push(SuggestedCompaction {
            span: KeySpan { key, end_key },
            bytes,
        });
    }
    let split = read_opt(data, offset, |data, offset| {
        Ok(SplitTrigger {
            left_desc: read_desc(data, offset)?,
            right_desc: read_desc(data, offset)?,
            rhs_delta: read_stats_delta(data, offset)?,
        })
    })?;
    let merge = read_opt(data, offset, |data, offset| {
        Ok(MergeTrigger {
            left_desc: read_desc(data, offset)?,
            right_desc: read_desc(data, offset)?,
            freeze_start: read_ts(data, offset)?,
        })
    })?;
    let state = read_opt(data, offset, |data, offset| {
        let truncated_state = read_opt(data, offset, |data, offset| {
            Ok(TruncatedState {
                index: read_u64(data, offset)?,
                term: read_u64(data, offset)?,
            })
        })?;
        let stats = read_opt(data, offset, read_stats)?;
        let using_applied_state_key = read_bool(data, offset)?;
        let desc = read_opt(data, offset, read_desc)?;
        let lease = read_opt(data, offset, read_lease)?;
        let gc_threshold = read_opt(data, offset, read_ts)?;
        let txn_span_gc_threshold = read_opt(data, offset, read_ts)?;
        Ok(ReplicaStateDelta {
            truncated_state,
            stats,
            using_applied_state_key,
            desc,
            lease,
            gc_threshold,
            txn_span_gc_threshold,
        })
    })?;
    let change_replicas = read_opt(data, offset, |data, offset| {
        let change_type = match read_u8(data, offset)? {
            1 => ReplicaChangeType::AddReplica,
            2 => ReplicaChangeType::RemoveReplica,
            other => anyhow::bail!("unknown replica change type {other}"),
        };
        Ok(ChangeReplicas {
            change_type,
            replica: read_replica(data, offset)?,
        })
    })?;
    let compute_checksum = read_opt(data, offset, |data, offset| {
        anyhow::ensure!(*offset + 16 <= data.len(), "short checksum id");
        let mut id = [0u8; 16];
        id.copy_from_slice(&data[*offset..*offset + 16]);
        *offset += 16;
        let version = read_u32(data, offset)?;
        let mode = match read_u8(data, offset)? {
            1 => ChecksumMode::Fast,
            2 => ChecksumMode::Full,
            other => anyhow::bail!("unknown checksum mode {other}"),
        };
        Ok(ComputeChecksum {
            checksum_id: Uuid::from_bytes(id),
            version,
            mode,
            save_snapshot: read_bool(data, offset)?,
            checkpoint: read_bool(data, offset)?,
        })
    })?;
    let add_sstable = read_opt(data, offset, |data, offset| {
        let payload = read_bytes(data, offset)?;
        let crc32 = read_u32(data, offset)?;
        Ok(AddSstable {
            data: payload.into(),
            crc32,
        })
    })?;
    Ok(ReplicatedEvalResult {
        is_lease_request,
        timestamp,
        prev_lease_proposal,
        block_reads,
        delta,
        deprecated_delta,
        raft_log_delta,
        suggested_compactions,
        split,
        merge,
        state,
        change_replicas,
        compute_checksum,
        add_sstable,
    })
}

/// Encode the flat key/value payload of a sideloaded SSTable.
pub fn encode_sst(entries: &[(Vec<u8>, Vec<u8>)]) -> Bytes {
    let mut size = 4;
    for (k, v) in entries {
        size += 4 + k.len() + 4 + v.len();
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (k, v) in entries {
        put_bytes(&mut out, k);
        put_bytes(&mut out, v);
    }
    out.into()
}

/// Decode the payload produced by [`encode_sst`].
pub fn decode_sst_entries(data: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut offset = 0usize;
    let count = read_u32(data, &mut offset)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_bytes(data, &mut offset)?;
        let value = read_bytes(data, &mut offset)?;
        entries.push((key, value));
    }
    anyhow::ensure!(offset == data.len(), "trailing bytes in sstable payload");
    Ok(entries)
}

fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(value as u8);
}

fn put_ts(out: &mut Vec<u8>, ts: Timestamp) {
    out.extend_from_slice(&ts.wall_nanos.to_be_bytes());
    out.extend_from_slice(&ts.logical.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn put_opt<T>(out: &mut Vec<u8>, value: Option<&T>, write: impl FnOnce(&mut Vec<u8>, &T)) {
    match value {
        Some(value) => {
            out.push(1);
            write(out, value);
        }
        None => out.push(0),
    }
}

fn put_replica(out: &mut Vec<u8>, replica: &ReplicaDescriptor) {
    out.extend_from_slice(&replica.node_id.to_be_bytes());
    out.extend_from_slice(&replica.store_id.to_be_bytes());
    out.extend_from_slice(&replica.replica_id.to_be_bytes());
}

fn put_desc(out: &mut Vec<u8>, desc: &RangeDescriptor) {
    out.extend_from_slice(&desc.range_id.to_be_bytes());
    put_bytes(out, &desc.start_key);
    put_bytes(out, &desc.end_key);
    out.extend_from_slice(&(desc.replicas.len() as u32).to_be_bytes());
    for replica in &desc.replicas {
        put_replica(out, replica);
    }
}

fn put_lease(out: &mut Vec<u8>, lease: &Lease) {
    put_replica(out, &lease.replica);
    put_ts(out, lease.start);
    put_opt(out, lease.expiration.as_ref(), |out, ts| put_ts(out, *ts));
    put_opt(out, lease.epoch.as_ref(), |out, epoch| {
        out.extend_from_slice(&epoch.to_be_bytes())
    });
    out.extend_from_slice(&lease.sequence.to_be_bytes());
    put_opt(out, lease.proposed_ts.as_ref(), |out, ts| put_ts(out, *ts));
}

fn put_stats_fields(out: &mut Vec<u8>, fields: [i64; 10], contains_estimates: bool) {
    for field in fields {
        out.extend_from_slice(&field.to_be_bytes());
    }
    put_bool(out, contains_estimates);
}

fn put_stats(out: &mut Vec<u8>, stats: &MvccStats) {
    put_stats_fields(
        out,
        [
            stats.live_bytes,
            stats.live_count,
            stats.key_bytes,
            stats.key_count,
            stats.val_bytes,
            stats.val_count,
            stats.intent_bytes,
            stats.intent_count,
            stats.sys_bytes,
            stats.sys_count,
        ],
        stats.contains_estimates,
    );
}

fn put_stats_delta(out: &mut Vec<u8>, delta: &MvccStatsDelta) {
    put_stats_fields(
        out,
        [
            delta.live_bytes,
            delta.live_count,
            delta.key_bytes,
            delta.key_count,
            delta.val_bytes,
            delta.val_count,
            delta.intent_bytes,
            delta.intent_count,
            delta.sys_bytes,
            delta.sys_count,
        ],
        delta.contains_estimates,
    );
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_bool(data: &[u8], offset: &mut usize) -> anyhow::Result<bool> {
    Ok(read_u8(data, offset)? != 0)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    Ok(read_u64(data, offset)? as i64)
}

fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short byte string");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

fn read_ts(data: &[u8], offset: &mut usize) -> anyhow::Result<Timestamp> {
    Ok(Timestamp {
        wall_nanos: read_u64(data, offset)?,
        logical: read_u32(data, offset)?,
    })
}

fn read_opt<T>(
    data: &[u8],
    offset: &mut usize,
    read: impl FnOnce(&[u8], &mut usize) -> anyhow::Result<T>,
) -> anyhow::Result<Option<T>> {
    match read_u8(data, offset)? {
        0 => Ok(None),
        1 => Ok(Some(read(data, offset)?)),
        other => anyhow::bail!("invalid presence byte {other}"),
    }
}

fn read_replica(data: &[u8], offset: &mut usize) -> anyhow::Result<ReplicaDescriptor> {
    Ok(ReplicaDescriptor {
        node_id: read_u64(data, offset)?,
        store_id: read_u64(data, offset)?,
        replica_id: read_u64(data, offset)?,
    })
}

fn read_desc(data: &[u8], offset: &mut usize) -> anyhow::Result<RangeDescriptor> {
    let range_id = read_u64(data, offset)?;
    let start_key = read_bytes(data, offset)?;
    let end_key = read_bytes(data, offset)?;
    let count = read_u32(data, offset)? as usize;
    let mut replicas = Vec::with_capacity(count);
    for _ in 0..count {
        replicas.push(read_replica(data, offset)?);
    }
    Ok(RangeDescriptor {
        range_id,
        start_key,
        end_key,
        replicas,
    })
}

fn read_lease(data: &[u8], offset: &mut usize) -> anyhow::Result<Lease> {
    let replica = read_replica(data, offset)?;
    let start = read_ts(data, offset)?;
    let expiration = read_opt(data, offset, read_ts)?;
    let epoch = read_opt(data, offset, read_u64)?;
    let sequence = read_u64(data, offset)?;
    let proposed_ts = read_opt(data, offset, read_ts)?;
    Ok(Lease {
        replica,
        start,
        expiration,
        epoch,
        sequence,
        proposed_ts,
    })
}

fn read_stats_fields(data: &[u8], offset: &mut usize) -> anyhow::Result<([i64; 10], bool)> {
    let mut fields = [0i64; 10];
    for field in &mut fields {
        *field = read_i64(data, offset)?;
    }
    Ok((fields, read_bool(data, offset)?))
}

fn read_stats(data: &[u8], offset: &mut usize) -> anyhow::Result<MvccStats> {
    let (f, contains_estimates) = read_stats_fields(data, offset)?;
    Ok(MvccStats {
        live_bytes: f[0],
        live_count: f[1],
        key_bytes: f[2],
        key_count: f[3],
        val_bytes: f[4],
        val_count: f[5],
        intent_bytes: f[6],
        intent_count: f[7],
        sys_bytes: f[8],
        sys_count: f[9],
        contains_estimates,
    })
}

fn read_stats_delta(data: &[u8], offset: &mut usize) -> anyhow::Result<MvccStatsDelta> {
    let (f, contains_estimates) = read_stats_fields(data, offset)?;
    Ok(MvccStatsDelta {
        live_bytes: f[0],
        live_count: f[1],
        key_bytes: f[2],
        key_count: f[3],
        val_bytes: f[4],
        val_count: f[5],
        intent_bytes: f[6],
        intent_count: f[7],
        sys_bytes: f[8],
        sys_count: f[9],
        contains_estimates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_command_round_trips() {
        let desc = RangeDescriptor {
            range_id: 12,
            start_key: b"c".to_vec(),
            end_key: b"q".to_vec(),
            replicas: vec![ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 3,
            }],
        };
        let cmd = RaftCommand {
            max_lease_index: 42,
            replicated: ReplicatedEvalResult {
                is_lease_request: true,
                timestamp: Timestamp {
                    wall_nanos: 999,
                    logical: 3,
                },
                prev_lease_proposal: Some(Timestamp {
                    wall_nanos: 7,
                    logical: 0,
                }),
                block_reads: true,
                delta: MvccStatsDelta {
                    live_bytes: -17,
                    key_count: 4,
                    ..Default::default()
                },
                deprecated_delta: None,
                raft_log_delta: -1024,
                suggested_compactions: vec![SuggestedCompaction {
                    span: KeySpan::new(b"a".to_vec(), b"b".to_vec()),
                    bytes: 99,
                }],
                split: None,
                merge: Some(MergeTrigger {
                    left_desc: desc.clone(),
                    right_desc: desc.clone(),
                    freeze_start: Timestamp {
                        wall_nanos: 55,
                        logical: 1,
                    },
                }),
                state: Some(ReplicaStateDelta {
                    truncated_state: Some(TruncatedState { index: 10, term: 2 }),
                    lease: Some(Lease {
                        replica: desc.replicas[0],
                        sequence: 8,
                        epoch: Some(5),
                        ..Default::default()
                    }),
                    using_applied_state_key: true,
                    ..Default::default()
                }),
                change_replicas: Some(ChangeReplicas {
                    change_type: ReplicaChangeType::RemoveReplica,
                    replica: desc.replicas[0],
                }),
                compute_checksum: Some(ComputeChecksum {
                    checksum_id: Uuid::new_v4(),
                    version: 4,
                    mode: ChecksumMode::Full,
                    save_snapshot: false,
                    checkpoint: true,
                }),
                add_sstable: Some(AddSstable {
                    data: Bytes::from_static(b"payload"),
                    crc32: 0xdeadbeef,
                }),
            },
            write_batch: Some(WriteBatch {
                data: Bytes::from_static(b"\x00\x00\x00\x00"),
            }),
            logical_op_log: None,
        };

        let encoded = encode_raft_command(&cmd);
        let decoded = decode_raft_command(&encoded).expect("decode");
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn write_batch_builder_preserves_op_order() {
        let mut builder = WriteBatchBuilder::default();
        builder.put(b"k1", b"v1");
        builder.delete(b"k1");
        builder.put(b"k2", b"v2");
        let ops = builder.finish().decode().expect("decode");
        assert_eq!(
            ops,
            vec![
                BatchOp::Put {
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec()
                },
                BatchOp::Delete {
                    key: b"k1".to_vec()
                },
                BatchOp::Put {
                    key: b"k2".to_vec(),
                    value: b"v2".to_vec()
                },
            ]
        );
    }
}
