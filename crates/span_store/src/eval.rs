//! A basic key/value evaluator.
//!
//! Runs Put/Delete/Get and lease batches against the engine's current view,
//! accumulating the write batch and the MVCC stats delta as it goes. Nothing
//! commits here: the batch and the result halves travel through the proposal
//! pipeline and the engine only changes at apply time.

use std::sync::Arc;

use crate::engine::Engine;
use crate::propose::{Evaluation, Evaluator};
use crate::result::MetricsDelta;
use crate::types::{BatchRequest, BatchResponse, ClientError, CmdId, EndedTxn, Request, Response};

pub struct KvEvaluator {
    engine: Arc<dyn Engine>,
}

impl KvEvaluator {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ClientError> {
        self.engine
            .get(key)
            .map_err(|err| ClientError::new(format!("engine read failed: {err}")))
    }
}

impl Evaluator for KvEvaluator {
    fn evaluate_write_batch(&self, _id: CmdId, req: &BatchRequest) -> Evaluation {
        let mut ev = Evaluation::default();
        let mut responses = Vec::with_capacity(req.requests.len());

        for request in &req.requests {
            match request {
                Request::Put { key, value } => {
                    let prev = match self.read(key) {
                        Ok(prev) => prev,
                        Err(err) => {
                            ev.err = Some(err);
                            return ev;
                        }
                    };
                    match prev {
                        Some(old) => {
                            ev.delta.val_bytes += value.len() as i64 - old.len() as i64;
                            ev.delta.live_bytes += value.len() as i64 - old.len() as i64;
                        }
                        None => {
                            ev.delta.key_bytes += key.len() as i64;
                            ev.delta.val_bytes += value.len() as i64;
                            ev.delta.live_bytes += (key.len() + value.len()) as i64;
                            ev.delta.key_count += 1;
                            ev.delta.val_count += 1;
                            ev.delta.live_count += 1;
                        }
                    }
                    ev.batch.put(key, value);
                    responses.push(Response::Put);
                }
                Request::Delete { key } => {
                    let prev = match self.read(key) {
                        Ok(prev) => prev,
                        Err(err) => {
                            ev.err = Some(err);
                            return ev;
                        }
                    };
                    if let Some(old) = prev {
                        ev.delta.key_bytes -= key.len() as i64;
                        ev.delta.val_bytes -= old.len() as i64;
                        ev.delta.live_bytes -= (key.len() + old.len()) as i64;
                        ev.delta.key_count -= 1;
                        ev.delta.val_count -= 1;
                        ev.delta.live_count -= 1;
                        ev.batch.delete(key);
                    }
                    responses.push(Response::Delete);
                }
                Request::Get { key } => match self.read(key) {
                    Ok(value) => responses.push(Response::Get { value }),
                    Err(err) => {
                        ev.err = Some(err);
                        return ev;
                    }
                },
                Request::RequestLease { lease } => {
                    ev.replicated
                        .state
                        .get_or_insert_with(Default::default)
                        .lease = Some(lease.clone());
                    ev.local.metrics = Some(MetricsDelta {
                        lease_request_success: 1,
                        ..Default::default()
                    });
                    responses.push(Response::Lease);
                }
                Request::TransferLease { lease } => {
                    ev.replicated.prev_lease_proposal = lease.proposed_ts;
                    ev.replicated
                        .state
                        .get_or_insert_with(Default::default)
                        .lease = Some(lease.clone());
                    ev.local.metrics = Some(MetricsDelta {
                        lease_transfer_success: 1,
                        ..Default::default()
                    });
                    responses.push(Response::Lease);
                }
                Request::ChangeReplicas => {
                    // Replica-set changes are planned by the replication
                    // change planner, which fills in the trigger itself.
                    ev.err = Some(ClientError::new(
                        "change-replicas batches cannot be evaluated directly",
                    ));
                    return ev;
                }
                Request::EndTxn { commit } => {
                    let Some(txn) = req.txn.as_ref() else {
                        ev.err = Some(ClientError::new("EndTxn on a non-transactional batch"));
                        return ev;
                    };
                    ev.local.end_txns = Some(vec![EndedTxn {
                        txn: txn.clone(),
                        always: !commit,
                    }]);
                    responses.push(Response::EndTxn);
                }
            }
        }

        ev.reply = Some(BatchResponse {
            timestamp: req.timestamp,
            responses,
        });
        ev
    }
}
