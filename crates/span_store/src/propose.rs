//! Turning a client batch into a proposal, and delivering the proposal's
//! result back to the waiting client.
//!
//! Evaluation runs the batch against the engine without committing,
//! producing a write batch plus the two result halves. Whether the outcome
//! must travel through consensus is decided here; if not, the result goes
//! straight back to the client while the local half is still applied.
//!
//! Completion is strictly at-most-once per sub-step: latch release, span
//! finish, and the channel send each happen no more than one time no matter
//! how the proposal terminates. Latches are released at apply time rather
//! than left to the client so that a cancelled client cannot leak them.

use tokio::sync::oneshot;

use crate::command::{RaftCommand, ReplicatedEvalResult, WriteBatchBuilder};
use crate::hlc::CLOCKLESS_MAX_OFFSET;
use crate::replica::Replica;
use crate::result::{EvalResult, LocalResult, ProposalResult};
use crate::stats::MvccStatsDelta;
use crate::types::{BatchRequest, BatchResponse, ClientError, CmdId};

/// Everything an evaluator returns for one batch.
#[derive(Default)]
pub struct Evaluation {
    pub batch: WriteBatchBuilder,
    pub delta: MvccStatsDelta,
    pub reply: Option<BatchResponse>,
    pub local: LocalResult,
    pub replicated: ReplicatedEvalResult,
    pub err: Option<ClientError>,
}

/// Runs a batch against a local engine view without committing. The
/// returned write batch is always consumed by the proposal builder,
/// success or not.
pub trait Evaluator: Send + Sync + 'static {
    fn evaluate_write_batch(&self, id: CmdId, req: &BatchRequest) -> Evaluation;
}

/// The latch-release hook tied to one request. Invoked with the final
/// reply/error so the timestamp cache can be updated as the latches drop.
pub struct EndCmds {
    done: Option<Box<dyn FnOnce(Option<&BatchResponse>, Option<&ClientError>) + Send>>,
}

impl EndCmds {
    pub fn new(
        done: impl FnOnce(Option<&BatchResponse>, Option<&ClientError>) + Send + 'static,
    ) -> Self {
        Self {
            done: Some(Box::new(done)),
        }
    }

    fn done(mut self, reply: Option<&BatchResponse>, err: Option<&ClientError>) {
        if let Some(done) = self.done.take() {
            done(reply, err);
        }
    }
}

/// An in-flight command: everything needed to propose it to consensus and
/// to hand its result back to the waiting client.
pub struct Proposal {
    /// Unique command identity, assigned at creation and never mutated.
    pub id: CmdId,
    pub(crate) span: Option<tracing::Span>,
    /// Logical tick at which the command was last (re-)proposed.
    pub proposed_at_ticks: u64,
    /// The serialized unit of replication. `None` when the request needs no
    /// consensus. Across reproposals only `max_lease_index` changes.
    pub command: Option<RaftCommand>,
    pub(crate) end_cmds: Option<EndCmds>,
    pub(crate) done_tx: Option<oneshot::Sender<ProposalResult>>,
    /// Proposer-only side effects. `None` on replicas that did not evaluate
    /// the command.
    pub local: Option<LocalResult>,
    /// The client's original batch, consulted by lease and replica-change
    /// classification.
    pub request: BatchRequest,
}

impl Proposal {
    /// Bind a tracing span to the proposal; it is finished exactly once on
    /// terminal outcome.
    pub fn attach_span(&mut self, span: tracing::Span) {
        self.span = Some(span);
    }

    /// Terminal completion: release latches, finish the span, and signal
    /// the waiting client. Called downstream of consensus for replicated
    /// commands and upstream for the rest; each sub-step runs at most once.
    pub fn finish_application(&mut self, result: ProposalResult) {
        if let Some(end_cmds) = self.end_cmds.take() {
            end_cmds.done(result.reply.as_ref(), result.err.as_ref());
        }
        if let Some(span) = self.span.take() {
            drop(span);
        }
        self.signal_proposal_result(result);
    }

    /// Signal the waiting client if it has not been signalled yet. Does not
    /// release latches, so it may be called upstream of consensus. The
    /// channel has capacity one and the sender reference is cleared, so the
    /// hand-off never blocks and a second signal is a no-op.
    pub fn signal_proposal_result(&mut self, result: ProposalResult) {
        if let Some(done_tx) = self.done_tx.take() {
            // The client may have stopped listening; application proceeds
            // regardless.
            let _ = done_tx.send(result);
        }
    }
}

impl Replica {
    /// Evaluate a batch into an [`EvalResult`], deciding whether the result
    /// must replicate through consensus. With `needs_consensus == false`
    /// (no-op or evaluation error) the result can return to the client
    /// directly, with the local half still applied.
    pub fn evaluate_proposal(
        &self,
        id: CmdId,
        req: &BatchRequest,
    ) -> (EvalResult, bool, Option<ClientError>) {
        if req.timestamp.is_zero() {
            return (
                EvalResult::default(),
                false,
                Some(ClientError::new(
                    "cannot propose a command with a zero timestamp",
                )),
            );
        }

        // No locks are held here; evaluation is expensive.
        let mut ev = self.evaluator().evaluate_write_batch(id, req);

        if let Some(err) = ev.err.take() {
            if let Some(txn) = err.txn.as_ref() {
                if req.txn.is_none() {
                    panic!("error had a txn but batch is non-transactional; err txn: {txn:?}");
                }
            }

            // A failed proposal keeps nothing but the whitelisted local
            // fields; its replicated half must not reach consensus.
            let intents = ev.local.detach_intents();
            let end_txns = ev.local.detach_end_txns(true);
            let res = EvalResult {
                local: LocalResult {
                    intents: Some(intents),
                    end_txns: Some(end_txns),
                    metrics: ev.local.metrics.take(),
                    ..Default::default()
                },
                replicated: ReplicatedEvalResult::default(),
                write_batch: None,
                logical_op_log: None,
            };
            return (res, false, Some(err));
        }

        // The reply lives on the proposing replica only and reaches the
        // client when the proposal completes.
        ev.local.reply = ev.reply.take();

        let store = self.store();
        // Consensus is required iff the command wrote something, moved the
        // stats, carries replicated side effects, or the cluster runs in
        // clockless mode where consensus linearizes reads too.
        let needs_consensus = !ev.batch.is_empty()
            || !ev.delta.is_zero()
            || ev.replicated != ReplicatedEvalResult::default()
            || store.clock().max_offset() == CLOCKLESS_MAX_OFFSET;

        let mut res = EvalResult {
            local: ev.local,
            replicated: ev.replicated,
            write_batch: None,
            logical_op_log: None,
        };

        if needs_consensus {
            res.write_batch = Some(ev.batch.finish());
            res.replicated.is_lease_request = req.is_lease_request();
            res.replicated.timestamp = req.timestamp;
            if store.cfg().versions.mvcc_network_stats {
                res.replicated.delta = ev.delta;
            } else {
                // Mixed-version cluster: older appliers expect the full
                // embedded stats struct.
                res.replicated.deprecated_delta = Some(ev.delta.to_stats());
            }

            // One-time switch to the combined applied-state record, sent
            // through consensus once the version gate allows it. Proposal
            // and application are separated in time, so the flag may be
            // emitted repeatedly; the migration is idempotent.
            let using_applied_state_key = {
                self.mu
                    .lock()
                    .expect("replica mutex poisoned")
                    .state
                    .using_applied_state_key
            };
            if !using_applied_state_key && store.cfg().versions.range_applied_state_key {
                res.replicated
                    .state
                    .get_or_insert_with(Default::default)
                    .using_applied_state_key = true;
            }
        }

        (res, needs_consensus, None)
    }

    /// Convert a batch into a [`Proposal`] by evaluating it. The proposal is
    /// valid even when an error is returned; it carries a command only when
    /// the result needs consensus.
    pub fn request_to_proposal(
        &self,
        id: CmdId,
        req: BatchRequest,
        end_cmds: Option<EndCmds>,
    ) -> (Proposal, oneshot::Receiver<ProposalResult>, Option<ClientError>) {
        let (res, needs_consensus, err) = self.evaluate_proposal(id, &req);

        let (done_tx, done_rx) = oneshot::channel();
        let mut proposal = Proposal {
            id,
            span: None,
            proposed_at_ticks: 0,
            command: None,
            end_cmds,
            done_tx: Some(done_tx),
            local: Some(res.local),
            request: req,
        };

        if needs_consensus {
            proposal.command = Some(RaftCommand {
                max_lease_index: 0,
                replicated: res.replicated,
                write_batch: res.write_batch,
                logical_op_log: res.logical_op_log,
            });
        }

        (proposal, done_rx, err)
    }

    /// Complete a proposal that never went to consensus: build its result,
    /// apply the local half, and finish. Mirrors the downstream completion
    /// path for replicated commands.
    pub fn finish_unreplicated_proposal(
        &self,
        proposal: &mut Proposal,
        err: Option<ClientError>,
    ) {
        let mut local = proposal.local.take().unwrap_or_default();
        let result = ProposalResult {
            reply: local.reply.take(),
            intents: local.detach_intents(),
            end_txns: local.detach_end_txns(err.is_some()),
            err,
        };
        self.handle_local_eval_result(local);
        proposal.finish_application(result);
    }
}
