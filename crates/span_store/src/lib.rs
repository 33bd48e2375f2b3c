//! Replica proposal and applied-result pipeline for a range-partitioned,
//! consensus-replicated key/value store.
//!
//! A range is a contiguous, end-exclusive span of keys; a replica is one copy
//! of a range on one store. Every write is evaluated locally into a write
//! batch plus a structured description of its side effects, proposed through
//! the consensus log, and then applied deterministically on every replica so
//! that in-memory and on-disk range state evolve identically everywhere.
//!
//! The crate is organized around that pipeline:
//! - [`propose`]: turning a client batch into a [`propose::Proposal`] and
//!   delivering its result back to the waiting client exactly once.
//! - [`apply`]: consuming the replicated and proposer-local halves of an
//!   evaluation result at apply time, with a field-exhaustion invariant
//!   (an unhandled side-effect field crashes the process).
//! - [`lease`], [`consistency`], [`ingest`]: the heavyweight side effects,
//!   namely range lease installation, consistency-checksum scheduling, and
//!   sideloaded SSTable ingestion.
//! - [`store`] and [`replica`]: the store-level collaborators (queues,
//!   gossip hooks, timestamp cache) and the per-replica state they act on.
//!
//! Consensus itself, the network transport, and the MVCC engine internals are
//! external collaborators reached through narrow contracts ([`engine::Engine`],
//! [`sideload::SideloadStorage`], [`propose::Evaluator`]).

pub mod apply;
pub mod command;
pub mod consistency;
pub mod engine;
pub mod eval;
pub mod hlc;
pub mod ingest;
pub mod lease;
pub mod propose;
pub mod replica;
pub mod result;
pub mod sideload;
pub mod stats;
pub mod store;
pub mod types;

pub use engine::{DiskEngine, Engine, EngineError, InMemEngine};
pub use lease::Lease;
pub use propose::{Evaluator, Proposal};
pub use replica::Replica;
pub use result::{LocalResult, ProposalResult};
pub use store::{Store, StoreConfig};
pub use types::{BatchRequest, BatchResponse, NodeId, RangeId, ReplicaId, StoreId};
