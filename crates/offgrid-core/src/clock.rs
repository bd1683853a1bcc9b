//! Lamport logical clock
//!
//! Each document session owns one `LamportClock`. Local ticks are pulled up to
//! wall-clock time when it is ahead, and otherwise step by one, so returned
//! timestamps are strictly increasing even when the wall clock stalls or two
//! ticks land in the same millisecond. Remote observations are folded in with
//! [`LamportClock::receive_tick`] so the next local tick is causally after
//! anything already seen.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Logical timestamp, compared before node id on ties.
pub type LogicalTimestamp = u64;

/// Source of wall-clock milliseconds.
pub trait WallClock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> u64 {
        // Pre-epoch system clocks clamp to zero; the counter still advances.
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Settable wall clock for tests and simulations.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monotonic timestamp source for one node.
#[derive(Clone)]
pub struct LamportClock {
    node_id: String,
    counter: LogicalTimestamp,
    wall: Arc<dyn WallClock>,
}

impl LamportClock {
    /// Create a clock driven by the system time.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_wall_clock(node_id, Arc::new(SystemClock))
    }

    /// Create a clock driven by a custom time source.
    pub fn with_wall_clock(node_id: impl Into<String>, wall: Arc<dyn WallClock>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
            wall,
        }
    }

    /// The node this clock stamps for.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Last value handed out or observed, without advancing.
    pub fn current(&self) -> LogicalTimestamp {
        self.counter
    }

    /// Produce a timestamp greater than every previous one from this clock.
    pub fn tick(&mut self) -> LogicalTimestamp {
        let now = self.wall.now_millis();
        if now > self.counter {
            self.counter = now;
        } else {
            self.counter = self.counter.saturating_add(1);
        }
        self.counter
    }

    /// Fold a remote timestamp into the counter.
    ///
    /// Adopts `remote` when it is ahead, then always steps by one.
    pub fn receive_tick(&mut self, remote: LogicalTimestamp) -> LogicalTimestamp {
        if remote > self.counter {
            self.counter = remote;
        }
        self.counter = self.counter.saturating_add(1);
        self.counter
    }
}

impl fmt::Debug for LamportClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LamportClock")
            .field("node_id", &self.node_id)
            .field("counter", &self.counter)
            .finish()
    }
}
