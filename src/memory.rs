//! Memory pressure probes for cache eviction.
//!
//! The image cache evicts not only on entry count but whenever the process
//! is short on memory. What "short" means is injected through [`MemoryProbe`]
//! so the cache never touches runtime introspection APIs directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capability that reports how much memory is in use and how much is allowed.
///
/// The cache compares `used_bytes / limit_bytes` against its configured
/// threshold on every insertion.
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use.
    fn used_bytes(&self) -> u64;

    /// Upper bound on bytes the process is willing to spend.
    fn limit_bytes(&self) -> u64;
}

/// Probe backed by a shared byte counter and a fixed budget.
///
/// The image cache keeps its own estimate of decoded payload bytes in an
/// [`AtomicU64`]; handing that counter to this probe makes the pressure check
/// track the cache's real footprint against a configured budget.
pub struct ByteBudgetProbe {
    used: Arc<AtomicU64>,
    limit: u64,
}

impl ByteBudgetProbe {
    /// Create a probe reading `used` against a fixed `limit` in bytes.
    pub fn new(used: Arc<AtomicU64>, limit: u64) -> Self {
        Self { used, limit }
    }
}

impl MemoryProbe for ByteBudgetProbe {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn limit_bytes(&self) -> u64 {
        self.limit
    }
}

/// Probe that never reports pressure. Leaves the cache bounded by entry
/// count alone.
pub struct NoPressureProbe;

impl MemoryProbe for NoPressureProbe {
    fn used_bytes(&self) -> u64 {
        0
    }

    fn limit_bytes(&self) -> u64 {
        u64::MAX
    }
}
