//! Evaluation results: the proposer-local half and the channel payload that
//! reaches the waiting client.

use bytes::Bytes;

use crate::command::{ReplicatedEvalResult, WriteBatch};
use crate::types::{BatchResponse, ClientError, EndedTxn, Intent, KeySpan, TxnMeta};

/// Leaseholder metrics accumulated during evaluation and published by the
/// proposer when the command completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsDelta {
    pub lease_request_success: i64,
    pub lease_request_error: i64,
    pub lease_transfer_success: i64,
    pub lease_transfer_error: i64,
}

impl MetricsDelta {
    pub fn is_zero(&self) -> bool {
        *self == MetricsDelta::default()
    }
}

/// The half of an evaluation that exists only on the proposing replica:
/// gossip hints, queue pokes, transaction-waiter updates, metrics, and the
/// client reply. Subject to the same exhaustion rule as the replicated half,
/// except that `reply` is zeroed up front because the proposal, not the
/// applier, owns it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalResult {
    pub reply: Option<BatchResponse>,
    /// Unresolved intents. Detached and consumed by the caller; a local
    /// result that still carries them at apply time is a bug.
    pub intents: Option<Vec<Intent>>,
    /// Ended transactions whose intents need asynchronous resolution. Same
    /// detachment rule as `intents`.
    pub end_txns: Option<Vec<EndedTxn>>,
    pub gossip_first_range: bool,
    pub maybe_add_to_split_queue: bool,
    pub maybe_gossip_system_config: bool,
    pub maybe_gossip_node_liveness: Option<KeySpan>,
    pub metrics: Option<MetricsDelta>,
    pub updated_txns: Option<Vec<TxnMeta>>,
}

impl LocalResult {
    /// Remove and return the intents; the field is left empty.
    pub fn detach_intents(&mut self) -> Vec<Intent> {
        self.intents.take().unwrap_or_default()
    }

    /// Remove and return the ended transactions. With `always_only`, only
    /// the ones marked for unconditional resolution survive; the rest are
    /// dropped because the client is no longer listening.
    pub fn detach_end_txns(&mut self, always_only: bool) -> Vec<EndedTxn> {
        let mut end_txns = self.end_txns.take().unwrap_or_default();
        if always_only {
            end_txns.retain(|et| et.always);
        }
        end_txns
    }
}

/// Everything evaluation produced for one batch: both result halves plus
/// the serialized write batch and the logical op log destined for the
/// command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalResult {
    pub local: LocalResult,
    pub replicated: ReplicatedEvalResult,
    pub write_batch: Option<WriteBatch>,
    pub logical_op_log: Option<Bytes>,
}

/// The payload handed to the waiting client. Exactly one of `reply` and
/// `err` is set. The side lists are consumed by the caller, not by the
/// proposal pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProposalResult {
    pub reply: Option<BatchResponse>,
    pub err: Option<ClientError>,
    pub intents: Vec<Intent>,
    pub end_txns: Vec<EndedTxn>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Timestamp;
    use uuid::Uuid;

    fn ended(always: bool) -> EndedTxn {
        EndedTxn {
            txn: TxnMeta {
                id: Uuid::new_v4(),
                key: b"k".to_vec(),
                epoch: 0,
                timestamp: Timestamp::zero(),
            },
            always,
        }
    }

    #[test]
    fn detach_end_txns_filters_on_always() {
        let mut local = LocalResult {
            end_txns: Some(vec![ended(true), ended(false), ended(true)]),
            ..Default::default()
        };
        let detached = local.detach_end_txns(true);
        assert_eq!(detached.len(), 2);
        assert!(local.end_txns.is_none());
    }
}
