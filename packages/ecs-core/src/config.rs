//! Build-time tunables for the storage engine.

/// Tunables controlling lock backoff, entity growth, and tracing capacity.
///
/// Exposes the engine's spin-retry count, entity allocation batch size, and
/// trace ring capacity as runtime-configurable defaults so a single binary
/// can still embed multiple `Ecs` instances with different policies.
#[derive(Debug, Clone)]
pub struct EcsConfig {
    /// Spin attempts before falling back to a cooperative wait in
    /// `ReadLock`/`WriteLock`/`CommitLock`.
    pub spinlock_retry_yield: u32,
    /// Number of entity slots allocated at once when the free list empties.
    pub entity_allocation_batch_size: usize,
    /// Capacity of the best-effort lock-event trace ring.
    pub performance_tracing_max_events: usize,
    /// Elides range/generation validation. Mirrors the `unchecked` build
    /// feature; kept as a runtime flag too so tests can exercise both paths
    /// from the same binary.
    pub unchecked_mode: bool,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            spinlock_retry_yield: 10,
            entity_allocation_batch_size: 1000,
            performance_tracing_max_events: 10_000,
            unchecked_mode: cfg!(feature = "unchecked"),
        }
    }
}
