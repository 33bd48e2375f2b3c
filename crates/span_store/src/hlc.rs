//! Hybrid logical clock timestamps.
//!
//! Timestamps order every versioned write and every lease in the system. The
//! clock hands out monotonic timestamps even when the wall clock stalls or
//! steps backwards, by bumping a logical counter at an unchanged wall time.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentinel max-offset marking a cluster that runs without synchronized
/// clocks. In that mode every read goes through consensus, which is checked
/// at proposal time.
pub const CLOCKLESS_MAX_OFFSET: Duration = Duration::MAX;

/// A hybrid wall/logical timestamp. Ordering is lexicographic on
/// `(wall_nanos, logical)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_nanos: u64,
    pub logical: u32,
}

impl Timestamp {
    pub const fn zero() -> Self {
        Self {
            wall_nanos: 0,
            logical: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.wall_nanos == 0 && self.logical == 0
    }

    /// Ratchet `self` forward to `other` if `other` is larger.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.wall_nanos, self.logical)
    }
}

/// Monotonic timestamp source with a configured maximum clock offset.
pub struct Clock {
    max_offset: Duration,
    last: Mutex<Timestamp>,
}

impl Clock {
    pub fn new(max_offset: Duration) -> Self {
        Self {
            max_offset,
            last: Mutex::new(Timestamp::zero()),
        }
    }

    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }

    /// Current timestamp, strictly greater than any previously returned one.
    pub fn now(&self) -> Timestamp {
        let wall = epoch_nanos();
        let mut last = self.last.lock().expect("clock mutex poisoned");
        if wall > last.wall_nanos {
            *last = Timestamp {
                wall_nanos: wall,
                logical: 0,
            };
        } else {
            last.logical += 1;
        }
        *last
    }
}

fn epoch_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new(Duration::from_millis(500));
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev, "clock went backwards: {next} <= {prev}");
            prev = next;
        }
    }

    #[test]
    fn forward_only_ratchets_up() {
        let mut ts = Timestamp {
            wall_nanos: 10,
            logical: 5,
        };
        ts.forward(Timestamp {
            wall_nanos: 10,
            logical: 3,
        });
        assert_eq!(ts.logical, 5);
        ts.forward(Timestamp {
            wall_nanos: 11,
            logical: 0,
        });
        assert_eq!(ts.wall_nanos, 11);
    }
}
