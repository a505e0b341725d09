//! Tunnel identities.
//!
//! Identities are allocated by the realm from a monotonic counter that is
//! never reset, so an id is never reused within a process run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-scoped identity of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic [`TunnelId`] allocator. The first id handed out is `1`.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> TunnelId {
        TunnelId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
