//! End-to-end exercise of the evaluate → propose → apply pipeline against
//! an in-memory engine: a proposer replica and a follower replica apply the
//! same committed bytes and must end up in the same state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use span_store::apply::CommittedEntry;
use span_store::engine::{Engine, InMemEngine};
use span_store::eval::KvEvaluator;
use span_store::hlc::Clock;
use span_store::lease::Lease;
use span_store::propose::EndCmds;
use span_store::replica::Replica;
use span_store::sideload::InMemSideload;
use span_store::store::{RecordingGossip, Store, StoreConfig};
use span_store::types::{
    BatchRequest, CmdId, RangeDescriptor, ReplicaDescriptor, Request, Response,
};

struct Node {
    store: Arc<Store>,
    replica: Arc<Replica>,
    engine: Arc<InMemEngine>,
}

fn node(store_id: u64, replica_id: u64) -> Node {
    let engine = Arc::new(InMemEngine::new());
    let gossip = Arc::new(RecordingGossip::default());
    let clock = Arc::new(Clock::new(Duration::from_millis(500)));
    let cfg = StoreConfig {
        node_id: store_id,
        store_id,
        ..Default::default()
    };
    let store = Store::new(cfg, clock, engine.clone(), gossip);
    let desc = RangeDescriptor {
        range_id: 7,
        start_key: Vec::new(),
        end_key: Vec::new(),
        replicas: vec![
            ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 1,
            },
            ReplicaDescriptor {
                node_id: 2,
                store_id: 2,
                replica_id: 2,
            },
        ],
    };
    let replica = Replica::new(
        &store,
        desc,
        replica_id,
        engine.clone(),
        Arc::new(InMemSideload::default()),
        Arc::new(KvEvaluator::new(engine.clone())),
    );
    store.add_replica(replica.clone());
    Node {
        store,
        replica,
        engine,
    }
}

#[tokio::test]
async fn write_proposal_replicates_and_reaches_the_client() {
    let proposer = node(1, 1);
    let follower = node(2, 2);

    let latch_releases = Arc::new(AtomicUsize::new(0));
    let end_cmds = {
        let latch_releases = latch_releases.clone();
        EndCmds::new(move |reply, err| {
            assert!(reply.is_some());
            assert!(err.is_none());
            latch_releases.fetch_add(1, Ordering::SeqCst);
        })
    };

    let id = CmdId::fresh();
    let req = BatchRequest {
        timestamp: proposer.store.clock().now(),
        txn: None,
        requests: vec![Request::Put {
            key: b"user/alice".to_vec(),
            value: b"v1".to_vec(),
        }],
    };
    let (proposal, rx, err) = proposer.replica.request_to_proposal(id, req, Some(end_cmds));
    assert!(err.is_none());
    assert!(proposal.command.is_some(), "writes must go through consensus");

    let data = proposer.replica.propose(proposal).expect("propose");
    assert_eq!(proposer.replica.pending_proposal_count(), 1);

    // "Commit" the entry and apply it on both replicas.
    let entry = CommittedEntry {
        term: 1,
        index: 1,
        id,
        data,
    };
    proposer
        .replica
        .apply_committed_entry(&entry)
        .expect("apply on proposer");
    follower
        .replica
        .apply_committed_entry(&entry)
        .expect("apply on follower");

    // The waiting client got its reply and the latches dropped.
    let result = rx.await.expect("proposal result");
    assert!(result.err.is_none());
    let reply = result.reply.expect("reply");
    assert_eq!(reply.responses, vec![Response::Put]);
    assert_eq!(latch_releases.load(Ordering::SeqCst), 1);
    assert_eq!(proposer.replica.pending_proposal_count(), 0);

    // Both replicas converged.
    assert_eq!(
        proposer.engine.get(b"user/alice").expect("get"),
        Some(b"v1".to_vec())
    );
    assert_eq!(
        follower.engine.get(b"user/alice").expect("get"),
        Some(b"v1".to_vec())
    );
    assert_eq!(proposer.replica.stats(), follower.replica.stats());
    assert_eq!(
        proposer.replica.applied_indices(),
        follower.replica.applied_indices()
    );
    assert!(
        proposer.replica.stats().live_bytes > 0,
        "the put must have moved the stats"
    );
}

#[tokio::test]
async fn read_only_batch_returns_without_consensus() {
    let n = node(1, 1);
    n.engine.put(b"user/bob", b"42").expect("seed");

    let id = CmdId::fresh();
    let req = BatchRequest {
        timestamp: n.store.clock().now(),
        txn: None,
        requests: vec![Request::Get {
            key: b"user/bob".to_vec(),
        }],
    };
    let (mut proposal, rx, err) = n.replica.request_to_proposal(id, req, None);
    assert!(err.is_none());
    assert!(proposal.command.is_none(), "reads skip consensus");

    n.replica.finish_unreplicated_proposal(&mut proposal, None);
    let result = rx.await.expect("proposal result");
    let reply = result.reply.expect("reply");
    assert_eq!(
        reply.responses,
        vec![Response::Get {
            value: Some(b"42".to_vec())
        }]
    );
}

#[tokio::test]
async fn lease_request_flows_through_the_pipeline() {
    let n = node(1, 1);

    let new_lease = Lease {
        replica: ReplicaDescriptor {
            node_id: 1,
            store_id: 1,
            replica_id: 1,
        },
        start: n.store.clock().now(),
        expiration: None,
        epoch: Some(3),
        sequence: 1,
        proposed_ts: None,
    };
    let id = CmdId::fresh();
    let req = BatchRequest {
        timestamp: n.store.clock().now(),
        txn: None,
        requests: vec![Request::RequestLease {
            lease: new_lease.clone(),
        }],
    };
    let (proposal, rx, err) = n.replica.request_to_proposal(id, req, None);
    assert!(err.is_none());
    let command = proposal.command.as_ref().expect("lease commands replicate");
    assert!(command.replicated.is_lease_request);

    let data = n.replica.propose(proposal).expect("propose");
    n.replica
        .apply_committed_entry(&CommittedEntry {
            term: 1,
            index: 1,
            id,
            data,
        })
        .expect("apply");

    let result = rx.await.expect("proposal result");
    assert!(result.err.is_none());
    assert_eq!(n.replica.current_lease(), new_lease);
    assert!(n.replica.txn_wait_queue.is_enabled());
    assert_eq!(n.store.metrics.snapshot().lease_request_success, 1);
    assert_eq!(n.replica.lease_history_snapshot().len(), 1);
}

#[tokio::test]
async fn follower_applies_without_signalling_anyone() {
    let proposer = node(1, 1);
    let follower = node(2, 2);

    let id = CmdId::fresh();
    let req = BatchRequest {
        timestamp: proposer.store.clock().now(),
        txn: None,
        requests: vec![Request::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }],
    };
    let (proposal, _rx, err) = proposer.replica.request_to_proposal(id, req, None);
    assert!(err.is_none());
    let data = proposer.replica.propose(proposal).expect("propose");

    // Only the follower applies; it holds no proposal for the command and
    // must not attempt any completion.
    follower
        .replica
        .apply_committed_entry(&CommittedEntry {
            term: 1,
            index: 4,
            id,
            data,
        })
        .expect("apply");
    assert_eq!(follower.replica.applied_indices().0, 4);
    assert_eq!(
        follower.engine.get(b"k").expect("get"),
        Some(b"v".to_vec())
    );
    assert_eq!(follower.replica.pending_proposal_count(), 0);
}
