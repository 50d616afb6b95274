//! Block pool metrics for monitoring and debugging.
//!
//! Tracks allocation and free traffic, evictor churn, and prefix cache
//! hit rates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for block manager activity.
pub struct BlockMetrics {
    /// Total allocation requests
    allocations: AtomicU64,
    /// Total blocks allocated
    blocks_allocated: AtomicU64,
    /// Total blocks released back to Free or Cached state
    blocks_freed: AtomicU64,
    /// Blocks handed to the evictor on release
    blocks_cached: AtomicU64,
    /// Cached blocks reclaimed as LRU victims
    blocks_evicted: AtomicU64,
    /// Prefix cache hits (blocks restored instead of recomputed)
    cache_hits: AtomicU64,
    /// Prefix cache misses
    cache_misses: AtomicU64,
    /// Restoration passes over a prompt
    cache_queries: AtomicU64,
}

impl Default for BlockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMetrics {
    pub fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            blocks_cached: AtomicU64::new(0),
            blocks_evicted: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_queries: AtomicU64::new(0),
        }
    }

    pub fn record_allocation(&self, num_blocks: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_cached(&self, num_blocks: usize) {
        self.blocks_cached
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, num_blocks: usize) {
        self.blocks_evicted
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_cache_query(&self, hits: usize, misses: usize) {
        self.cache_queries.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.cache_misses
            .fetch_add(misses as u64, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    pub fn blocks_cached(&self) -> u64 {
        self.blocks_cached.load(Ordering::Relaxed)
    }

    pub fn blocks_evicted(&self) -> u64 {
        self.blocks_evicted.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn cache_queries(&self) -> u64 {
        self.cache_queries.load(Ordering::Relaxed)
    }

    /// Prefix cache hit rate in [0.0, 1.0], or `None` before any query.
    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: self.allocations(),
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
            blocks_cached: self.blocks_cached(),
            blocks_evicted: self.blocks_evicted(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_queries: self.cache_queries(),
        }
    }
}

/// Point-in-time copy of the counters, serializable for logging endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_cached: u64,
    pub blocks_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_queries: u64,
}
