//! MVCC statistics for one range and the per-command deltas that mutate them.
//!
//! Stats are maintained incrementally: evaluation computes a delta against the
//! engine, the delta replicates inside the command, and every replica adds it
//! to its in-memory copy at apply time. Both halves therefore have to use the
//! same integer arithmetic or replicas drift apart.

use serde::{Deserialize, Serialize};

/// Aggregate MVCC statistics for a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub intent_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
    /// Set when the stats were seeded from an estimate (e.g. the right-hand
    /// side of a split) and may not match a recomputation exactly.
    pub contains_estimates: bool,
}

impl MvccStats {
    pub fn is_zero(&self) -> bool {
        *self == MvccStats::default()
    }

    /// Total logical byte footprint used for split/merge sizing decisions.
    pub fn total_bytes(&self) -> i64 {
        self.key_bytes + self.val_bytes + self.sys_bytes
    }

    pub fn add(&mut self, delta: MvccStatsDelta) {
        self.live_bytes += delta.live_bytes;
        self.live_count += delta.live_count;
        self.key_bytes += delta.key_bytes;
        self.key_count += delta.key_count;
        self.val_bytes += delta.val_bytes;
        self.val_count += delta.val_count;
        self.intent_bytes += delta.intent_bytes;
        self.intent_count += delta.intent_count;
        self.sys_bytes += delta.sys_bytes;
        self.sys_count += delta.sys_count;
        self.contains_estimates |= delta.contains_estimates;
    }

    pub fn subtract(&mut self, delta: MvccStatsDelta) {
        self.add(delta.negated());
    }

    pub fn to_delta(self) -> MvccStatsDelta {
        MvccStatsDelta {
            live_bytes: self.live_bytes,
            live_count: self.live_count,
            key_bytes: self.key_bytes,
            key_count: self.key_count,
            val_bytes: self.val_bytes,
            val_count: self.val_count,
            intent_bytes: self.intent_bytes,
            intent_count: self.intent_count,
            sys_bytes: self.sys_bytes,
            sys_count: self.sys_count,
            contains_estimates: self.contains_estimates,
        }
    }
}

/// The replicated per-command change to a range's [`MvccStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStatsDelta {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub intent_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
    pub contains_estimates: bool,
}

impl MvccStatsDelta {
    pub fn is_zero(&self) -> bool {
        *self == MvccStatsDelta::default()
    }

    pub fn negated(mut self) -> Self {
        self.live_bytes = -self.live_bytes;
        self.live_count = -self.live_count;
        self.key_bytes = -self.key_bytes;
        self.key_count = -self.key_count;
        self.val_bytes = -self.val_bytes;
        self.val_count = -self.val_count;
        self.intent_bytes = -self.intent_bytes;
        self.intent_count = -self.intent_count;
        self.sys_bytes = -self.sys_bytes;
        self.sys_count = -self.sys_count;
        self
    }

    pub fn add(&mut self, other: MvccStatsDelta) {
        self.live_bytes += other.live_bytes;
        self.live_count += other.live_count;
        self.key_bytes += other.key_bytes;
        self.key_count += other.key_count;
        self.val_bytes += other.val_bytes;
        self.val_count += other.val_count;
        self.intent_bytes += other.intent_bytes;
        self.intent_count += other.intent_count;
        self.sys_bytes += other.sys_bytes;
        self.sys_count += other.sys_count;
        self.contains_estimates |= other.contains_estimates;
    }

    pub fn to_stats(self) -> MvccStats {
        let mut stats = MvccStats::default();
        stats.add(self);
        stats
    }
}
