//! Core identifiers, descriptors, and the client batch request/response model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hlc::Timestamp;
use crate::lease::Lease;

pub type NodeId = u64;
pub type StoreId = u64;
pub type RangeId = u64;
pub type ReplicaId = u64;

/// The range holding the cluster's meta addressing records. Acquiring its
/// lease triggers a re-gossip so clients can route again after a failover.
pub const FIRST_RANGE_ID: RangeId = 1;

/// Opaque identifier assigned to a command at proposal time. Replays and
/// reproposals of the same evaluation carry the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdId([u8; 16]);

impl CmdId {
    pub fn fresh() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for CmdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for CmdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A contiguous, end-exclusive span of keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpan {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl KeySpan {
    pub fn new(key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }
}

/// One replica of a range, addressed by the node and store holding it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

/// Authoritative description of a range: its key span and replica set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl RangeDescriptor {
    pub fn replica_on_store(&self, store_id: StoreId) -> Option<ReplicaDescriptor> {
        self.replicas.iter().copied().find(|r| r.store_id == store_id)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }
}

/// Transaction metadata attached to transactional batches and to the errors
/// and intents they produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnMeta {
    pub id: Uuid,
    pub key: Vec<u8>,
    pub epoch: u32,
    pub timestamp: Timestamp,
}

/// A provisional write left behind by an unfinished transaction. Detached
/// from the evaluation result and resolved by the caller, never by the
/// proposal pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intent {
    pub span: KeySpan,
    pub txn: TxnMeta,
}

/// Record of a transaction ended by this batch, carrying the intents that
/// still need asynchronous resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndedTxn {
    pub txn: TxnMeta,
    /// Resolve even if the client gave up on the batch.
    pub always: bool,
}

/// One operation inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
    RequestLease { lease: Lease },
    TransferLease { lease: Lease },
    ChangeReplicas,
    EndTxn { commit: bool },
}

/// A client batch: the unit of evaluation and proposal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchRequest {
    pub timestamp: Timestamp,
    pub txn: Option<TxnMeta>,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    /// A lease request/transfer is always a single-request batch and is
    /// treated specially throughout the proposal pipeline.
    pub fn is_lease_request(&self) -> bool {
        matches!(
            self.requests.as_slice(),
            [Request::RequestLease { .. }] | [Request::TransferLease { .. }]
        )
    }

    pub fn is_change_replicas(&self) -> bool {
        matches!(self.requests.as_slice(), [Request::ChangeReplicas])
    }
}

/// Per-request response payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Put,
    Delete,
    Get { value: Option<Vec<u8>> },
    Lease,
    ChangeReplicas,
    EndTxn,
}

/// The reply returned to the client for one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResponse {
    pub timestamp: Timestamp,
    pub responses: Vec<Response>,
}

/// A client-visible command failure. Carried in the proposal result; never
/// used for invariant violations, which crash instead.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
    pub txn: Option<TxnMeta>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            txn: None,
        }
    }

    pub fn with_txn(message: impl Into<String>, txn: TxnMeta) -> Self {
        Self {
            message: message.into(),
            txn: Some(txn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_request_classification_requires_single_request() {
        let mut req = BatchRequest {
            requests: vec![Request::RequestLease {
                lease: Lease::default(),
            }],
            ..Default::default()
        };
        assert!(req.is_lease_request());

        req.requests.push(Request::Put {
            key: b"a".to_vec(),
            value: b"b".to_vec(),
        });
        assert!(!req.is_lease_request());
    }

    #[test]
    fn descriptor_key_containment_is_end_exclusive() {
        let desc = RangeDescriptor {
            range_id: 7,
            start_key: b"c".to_vec(),
            end_key: b"m".to_vec(),
            replicas: Vec::new(),
        };
        assert!(desc.contains_key(b"c"));
        assert!(desc.contains_key(b"lzz"));
        assert!(!desc.contains_key(b"m"));
        assert!(!desc.contains_key(b"b"));
    }
}
