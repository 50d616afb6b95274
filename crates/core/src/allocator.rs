use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{block_content, BlockId, KVCacheBlock};
use crate::evictor::Evictor;
use crate::metrics::BlockMetrics;
use crate::prefix_index::PrefixIndex;
use crate::sequence::TokenId;

/// Fixed-capacity block pool.
///
/// Owns the arena of [`KVCacheBlock`]s. Free blocks sit on a FIFO free list;
/// with prefix caching enabled, released blocks are routed to the evictor
/// instead, where they stay addressable by content until reclaimed as LRU
/// victims.
pub struct BlockAllocator {
    blocks: Vec<KVCacheBlock>,
    free_list: VecDeque<BlockId>,
    evictor: Evictor,
    enable_prefix_caching: bool,
    metrics: Arc<BlockMetrics>,
}

impl BlockAllocator {
    pub fn new(
        num_blocks: usize,
        enable_prefix_caching: bool,
        metrics: Arc<BlockMetrics>,
    ) -> Self {
        Self {
            blocks: (0..num_blocks).map(KVCacheBlock::new).collect(),
            free_list: (0..num_blocks).collect(),
            evictor: Evictor::new(),
            enable_prefix_caching,
            metrics,
        }
    }

    pub fn num_total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Free list plus retained (cached) blocks; both can service allocation.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len() + self.evictor.len()
    }

    pub fn num_free_list_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.evictor.len()
    }

    pub fn can_allocate_blocks(&self, num_blocks: usize) -> bool {
        num_blocks <= self.num_free_blocks()
    }

    pub fn used_percentage(&self) -> f64 {
        let total = self.blocks.len();
        (total - self.num_free_blocks()) as f64 / total as f64
    }

    pub fn block(&self, id: BlockId) -> &KVCacheBlock {
        &self.blocks[id]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut KVCacheBlock {
        &mut self.blocks[id]
    }

    /// Pop the head of the free list. Prefix caching must be disabled; the
    /// caller checks capacity up front.
    pub(crate) fn allocate_plain(&mut self) -> BlockId {
        assert!(
            !self.enable_prefix_caching,
            "plain allocation is only valid with prefix caching disabled"
        );
        let id = self
            .free_list
            .pop_front()
            .expect("capacity checked by caller");
        self.blocks[id].increment();
        id
    }

    /// Allocate a block carrying `(prompt ++ generated)[..content_len]` as
    /// its content, registered in the live index. Prefers the free list and
    /// falls back to reclaiming the LRU cached block; returns `None` when
    /// both are exhausted.
    pub(crate) fn allocate_indexed(
        &mut self,
        live_index: &mut PrefixIndex,
        prompt: &[TokenId],
        generated: &[TokenId],
        content_len: usize,
    ) -> Option<BlockId> {
        assert!(
            self.enable_prefix_caching,
            "indexed allocation requires prefix caching"
        );
        let content = block_content(prompt, generated, content_len);

        if let Some(id) = self.free_list.pop_front() {
            self.blocks[id].increment();
            live_index.insert(&content, id);
            self.blocks[id].set_content(content);
            return Some(id);
        }

        let id = self.evictor.take_lru(&mut self.blocks)?;
        self.metrics.record_eviction(1);
        tracing::trace!(block = id, "reclaimed LRU cached block");
        // the victim's previous content must leave the live index before the
        // rewrite, unless a newer block has already claimed that key
        if live_index.lookup(self.blocks[id].content()) == Some(id) {
            live_index.erase(self.blocks[id].content());
        }
        live_index.insert(&content, id);
        self.blocks[id].set_content(content);
        Some(id)
    }

    /// Drop one reference. A block reaching ref_count 0 returns to the free
    /// list, or is retained by the evictor under its last content when
    /// prefix caching is on.
    pub(crate) fn free(&mut self, id: BlockId) {
        self.blocks[id].release();
        if !self.blocks[id].is_free() {
            return;
        }
        self.metrics.record_free(1);
        if self.enable_prefix_caching {
            debug_assert!(!self.evictor.contains(id), "freed block is already cached");
            self.evictor.add(&mut self.blocks[id]);
            self.metrics.record_cached(1);
        } else {
            self.free_list.push_back(id);
        }
    }

    /// Resolve `tokens` to a block: first among cached blocks (the hit is
    /// removed from the evictor and returns with ref_count 1), then among
    /// live blocks (the hit gains a reference and becomes shared).
    pub(crate) fn lookup_cached(
        &mut self,
        live_index: &PrefixIndex,
        tokens: &[TokenId],
    ) -> Option<BlockId> {
        if let Some(id) = self.evictor.take_by_content(&mut self.blocks, tokens) {
            return Some(id);
        }
        let id = live_index.lookup(tokens)?;
        self.blocks[id].increment();
        Some(id)
    }

    /// Resolve a cached block whose content extends more than `min_tokens`
    /// of `tokens`. Evictor-only: a live block's content cannot be rewritten
    /// safely, and the caller will truncate the match.
    pub(crate) fn lookup_cached_prefix(
        &mut self,
        tokens: &[TokenId],
        min_tokens: usize,
    ) -> Option<(BlockId, usize)> {
        self.evictor
            .take_by_prefix(&mut self.blocks, tokens, min_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_allocator(num_blocks: usize) -> BlockAllocator {
        BlockAllocator::new(num_blocks, false, Arc::new(BlockMetrics::new()))
    }

    fn caching_allocator(num_blocks: usize) -> BlockAllocator {
        BlockAllocator::new(num_blocks, true, Arc::new(BlockMetrics::new()))
    }

    #[test]
    fn new_pool_is_all_free() {
        let alloc = plain_allocator(16);
        assert_eq!(alloc.num_total_blocks(), 16);
        assert_eq!(alloc.num_free_blocks(), 16);
        assert_eq!(alloc.used_percentage(), 0.0);
    }

    #[test]
    fn plain_allocate_pops_low_ids_first() {
        let mut alloc = plain_allocator(4);
        assert_eq!(alloc.allocate_plain(), 0);
        assert_eq!(alloc.allocate_plain(), 1);
        assert_eq!(alloc.num_free_blocks(), 2);
        assert_eq!(alloc.block(0).ref_count(), 1);
    }

    #[test]
    fn free_returns_to_free_list_without_caching() {
        let mut alloc = plain_allocator(2);
        let id = alloc.allocate_plain();
        alloc.free(id);
        assert_eq!(alloc.num_free_blocks(), 2);
        assert_eq!(alloc.num_cached_blocks(), 0);
    }

    #[test]
    fn free_routes_to_evictor_with_caching() {
        let mut alloc = caching_allocator(2);
        let mut live = PrefixIndex::new();
        let id = alloc.allocate_indexed(&mut live, &[1, 2], &[], 2).unwrap();
        alloc.free(id);
        assert_eq!(alloc.num_cached_blocks(), 1);
        assert_eq!(alloc.num_free_list_blocks(), 1);
        assert_eq!(alloc.num_free_blocks(), 2);
    }

    #[test]
    fn free_of_shared_block_keeps_it_live() {
        let mut alloc = plain_allocator(2);
        let id = alloc.allocate_plain();
        alloc.block_mut(id).increment();
        alloc.free(id);
        assert_eq!(alloc.block(id).ref_count(), 1);
        assert_eq!(alloc.num_free_blocks(), 1);
    }

    #[test]
    fn indexed_allocation_registers_content() {
        let mut alloc = caching_allocator(2);
        let mut live = PrefixIndex::new();
        let id = alloc
            .allocate_indexed(&mut live, &[7, 8, 9], &[], 3)
            .unwrap();
        assert_eq!(live.lookup(&[7, 8, 9]), Some(id));
        assert_eq!(alloc.block(id).content(), &[7, 8, 9]);
    }

    #[test]
    fn indexed_allocation_reclaims_lru_and_reindexes() {
        let mut alloc = caching_allocator(1);
        let mut live = PrefixIndex::new();
        let id = alloc.allocate_indexed(&mut live, &[1, 2], &[], 2).unwrap();
        alloc.free(id);

        // pool exhausted: the cached block is rewritten for the new content
        let reused = alloc.allocate_indexed(&mut live, &[8, 9], &[], 2).unwrap();
        assert_eq!(reused, id);
        assert_eq!(live.lookup(&[1, 2]), None);
        assert_eq!(live.lookup(&[8, 9]), Some(id));
        assert_eq!(alloc.block(id).content(), &[8, 9]);
    }

    #[test]
    fn indexed_allocation_exhausted_returns_none() {
        let mut alloc = caching_allocator(1);
        let mut live = PrefixIndex::new();
        let _held = alloc.allocate_indexed(&mut live, &[1], &[], 1).unwrap();
        assert_eq!(alloc.allocate_indexed(&mut live, &[2], &[], 1), None);
    }

    #[test]
    fn lookup_cached_prefers_evictor_then_live() {
        let mut alloc = caching_allocator(2);
        let mut live = PrefixIndex::new();
        let a = alloc.allocate_indexed(&mut live, &[1, 2], &[], 2).unwrap();
        let b = alloc.allocate_indexed(&mut live, &[3, 4], &[], 2).unwrap();
        alloc.free(a);

        // a is cached: the hit revives it
        assert_eq!(alloc.lookup_cached(&live, &[1, 2]), Some(a));
        assert_eq!(alloc.block(a).ref_count(), 1);
        assert_eq!(alloc.num_cached_blocks(), 0);

        // b is live: the hit shares it
        assert_eq!(alloc.lookup_cached(&live, &[3, 4]), Some(b));
        assert_eq!(alloc.block(b).ref_count(), 2);

        assert_eq!(alloc.lookup_cached(&live, &[9, 9]), None);
    }

    #[test]
    fn metrics_observe_eviction_traffic() {
        let metrics = Arc::new(BlockMetrics::new());
        let mut alloc = BlockAllocator::new(1, true, Arc::clone(&metrics));
        let mut live = PrefixIndex::new();
        let id = alloc.allocate_indexed(&mut live, &[1], &[], 1).unwrap();
        alloc.free(id);
        alloc.allocate_indexed(&mut live, &[2], &[], 1).unwrap();
        assert_eq!(metrics.blocks_freed(), 1);
        assert_eq!(metrics.blocks_cached(), 1);
        assert_eq!(metrics.blocks_evicted(), 1);
    }

    #[test]
    #[should_panic(expected = "prefix caching disabled")]
    fn plain_allocation_panics_with_caching_on() {
        let mut alloc = caching_allocator(1);
        alloc.allocate_plain();
    }

    #[test]
    #[should_panic(expected = "requires prefix caching")]
    fn indexed_allocation_panics_with_caching_off() {
        let mut alloc = plain_allocator(1);
        let mut live = PrefixIndex::new();
        let _ = alloc.allocate_indexed(&mut live, &[1], &[], 1);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let mut alloc = plain_allocator(1);
        let id = alloc.allocate_plain();
        alloc.free(id);
        alloc.free(id);
    }
}
