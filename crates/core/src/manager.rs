//! Top-level coordinator: block tables, admission, forking and restoration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::allocator::BlockAllocator;
use crate::block::{block_content, BlockId, KVCacheBlock};
use crate::config::BlockManagerConfig;
use crate::error::ConfigError;
use crate::metrics::BlockMetrics;
use crate::prefix_index::PrefixIndex;
use crate::sequence::{SeqId, Sequence, SequenceGroup, TokenId};

/// Owns the block pool and the per-sequence block tables.
///
/// All state lives here; multiple managers (e.g. one per device) can coexist
/// without interaction. Methods run on the scheduler thread between steps
/// and never block.
pub struct BlockManager {
    allocator: BlockAllocator,
    /// Content index over live blocks. Entries are erased lazily: a freed
    /// block keeps its key (the evictor is consulted first on lookups) until
    /// the block's content is rewritten.
    live_index: PrefixIndex,
    block_tables: HashMap<SeqId, Vec<BlockId>>,
    block_size: usize,
    enable_prefix_caching: bool,
    metrics: Arc<BlockMetrics>,
}

impl BlockManager {
    pub fn new(num_blocks: usize, enable_prefix_caching: bool, block_size: usize) -> Self {
        Self::with_metrics(
            num_blocks,
            enable_prefix_caching,
            block_size,
            Arc::new(BlockMetrics::new()),
        )
    }

    pub fn with_metrics(
        num_blocks: usize,
        enable_prefix_caching: bool,
        block_size: usize,
        metrics: Arc<BlockMetrics>,
    ) -> Self {
        assert!(num_blocks > 0, "block pool must hold at least one block");
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            allocator: BlockAllocator::new(num_blocks, enable_prefix_caching, Arc::clone(&metrics)),
            live_index: PrefixIndex::new(),
            block_tables: HashMap::new(),
            block_size,
            enable_prefix_caching,
            metrics,
        }
    }

    pub fn from_config(config: &BlockManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            config.num_blocks,
            config.enable_prefix_caching,
            config.block_size,
        ))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_total_blocks(&self) -> usize {
        self.allocator.num_total_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free_blocks()
    }

    pub fn num_free_list_blocks(&self) -> usize {
        self.allocator.num_free_list_blocks()
    }

    /// Blocks retained by the evictor, still addressable by content.
    pub fn num_cached_blocks(&self) -> usize {
        self.allocator.num_cached_blocks()
    }

    pub fn can_allocate_blocks(&self, num_blocks: usize) -> bool {
        self.allocator.can_allocate_blocks(num_blocks)
    }

    pub fn used_percentage(&self) -> f64 {
        self.allocator.used_percentage()
    }

    pub fn block(&self, id: BlockId) -> &KVCacheBlock {
        self.allocator.block(id)
    }

    pub fn has_block_table(&self, seq_id: SeqId) -> bool {
        self.block_tables.contains_key(&seq_id)
    }

    pub fn block_table(&self, seq_id: SeqId) -> Option<&[BlockId]> {
        self.block_tables.get(&seq_id).map(Vec::as_slice)
    }

    pub fn metrics(&self) -> &Arc<BlockMetrics> {
        &self.metrics
    }

    /// Append `num_blocks` fresh blocks to the sequence's table.
    ///
    /// With prefix caching each new block is indexed under the token prefix
    /// it extends the sequence to; the final block may cover fewer tokens
    /// than `block_size`.
    pub fn allocate(&mut self, seq: &Sequence, num_blocks: usize, prompt_ids: &[TokenId]) {
        assert!(num_blocks > 0, "allocation of zero blocks");
        assert!(
            self.can_allocate_blocks(num_blocks),
            "allocation of {num_blocks} blocks exceeds free capacity {}",
            self.num_free_blocks()
        );
        assert!(
            !self.enable_prefix_caching || !prompt_ids.is_empty(),
            "prompt tokens are required for content indexing"
        );

        let total_tokens = prompt_ids.len() + seq.generated_len();
        let mut covered = self.block_tables.get(&seq.id()).map_or(0, Vec::len) * self.block_size;
        for _ in 0..num_blocks {
            let id = if self.enable_prefix_caching {
                covered = (covered + self.block_size).min(total_tokens);
                self.allocator
                    .allocate_indexed(
                        &mut self.live_index,
                        prompt_ids,
                        seq.generated_ids(),
                        covered,
                    )
                    .expect("capacity checked above")
            } else {
                self.allocator.allocate_plain()
            };
            self.block_tables.entry(seq.id()).or_default().push(id);
        }
        self.metrics.record_allocation(num_blocks);
    }

    /// Give the child a reference-counted copy of the parent's table. Every
    /// shared block becomes copy-on-write.
    pub fn fork_sequence(&mut self, parent_id: SeqId, child_id: SeqId) {
        assert!(
            !self.block_tables.contains_key(&child_id),
            "fork target {child_id} already has a block table"
        );
        let table = self
            .block_tables
            .get(&parent_id)
            .expect("fork source has no block table")
            .clone();
        for &id in &table {
            self.allocator.block_mut(id).increment();
        }
        self.block_tables.insert(child_id, table);
    }

    /// Release every block of the sequence and drop its table. Freeing an
    /// unknown sequence is a no-op, so the call is idempotent by effect.
    pub fn free_sequence(&mut self, seq_id: SeqId) {
        if let Some(table) = self.block_tables.remove(&seq_id) {
            for id in table {
                self.allocator.free(id);
            }
        }
    }

    /// Release the tail block and shrink the table by one. Returns whether
    /// the released block actually reached the Free state (a shared block
    /// stays live with its other holders).
    pub fn free_last_block(&mut self, seq_id: SeqId) -> bool {
        let table = self
            .block_tables
            .get_mut(&seq_id)
            .expect("sequence has no block table");
        let id = table.pop().expect("tables are never empty");
        if table.is_empty() {
            self.block_tables.remove(&seq_id);
        }
        self.allocator.free(id);
        self.allocator.block(id).is_free()
    }

    /// Release the last `num_blocks` blocks, tail first.
    pub fn free_sequence_partially(&mut self, seq_id: SeqId, num_blocks: usize) {
        let table = self
            .block_tables
            .get_mut(&seq_id)
            .expect("sequence has no block table");
        assert!(
            table.len() >= num_blocks,
            "cannot free {num_blocks} blocks from a table of {}",
            table.len()
        );
        let tail = table.split_off(table.len() - num_blocks);
        if table.is_empty() {
            self.block_tables.remove(&seq_id);
        }
        for id in tail.into_iter().rev() {
            self.allocator.free(id);
        }
    }

    /// Recover capacity for a group whose demand exceeds supply: free
    /// ceil(num_required / active) tail blocks from each active sequence
    /// that holds any. Returns the per-sequence count.
    pub fn free_group_partially(
        &mut self,
        group: &SequenceGroup,
        num_required_blocks: usize,
    ) -> usize {
        let num_active = group.active_sequences().count();
        if num_active == 0 {
            return 0;
        }
        let per_sequence = num_required_blocks.div_ceil(num_active);
        tracing::debug!(
            num_required_blocks,
            per_sequence,
            "freeing tail blocks to recover capacity"
        );
        for seq in group.active_sequences() {
            let Some(table) = self.block_tables.get(&seq.id()) else {
                continue;
            };
            let to_free = per_sequence.min(table.len());
            if to_free > 0 {
                self.free_sequence_partially(seq.id(), to_free);
            }
        }
        per_sequence
    }

    /// Physical blocks an append step would consume for this group.
    ///
    /// A sequence without a table charges its full logical span. A shared
    /// tail is charged once for all its holders: `ref_count - 1` copies when
    /// the partial tail merely needs splitting, `needed * ref_count` when
    /// every holder will also grow.
    pub fn required_blocks_count(&self, group: &SequenceGroup) -> usize {
        let num_logical = group.num_logical_blocks();
        let mut required = 0;
        let mut counted_tails: HashSet<BlockId> = HashSet::new();

        for seq in group.running_sequences() {
            let Some(table) = self.block_tables.get(&seq.id()) else {
                required += num_logical;
                continue;
            };
            let num_physical = table.len();
            if num_physical > num_logical {
                continue;
            }
            let tail = *table.last().expect("tables are never empty");
            if !counted_tails.insert(tail) {
                continue;
            }
            let needed = num_logical - num_physical;
            let refs = self.allocator.block(tail).ref_count();
            required += if refs > 1 {
                if needed == 0 {
                    refs - 1
                } else {
                    needed * refs
                }
            } else {
                needed
            };
        }
        required
    }

    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        self.required_blocks_count(group) <= self.num_free_blocks()
    }

    /// Grow every running sequence to the group's logical span, splitting
    /// shared tails copy-on-write. Returns the copy plan
    /// `old block index -> new block indices` for the cache-tensor manager
    /// to apply. Callers must have verified [`Self::can_append_slots`].
    pub fn append_slots(&mut self, group: &SequenceGroup) -> HashMap<BlockId, Vec<BlockId>> {
        let num_logical = group.num_logical_blocks();
        let mut copy_plan: HashMap<BlockId, Vec<BlockId>> = HashMap::new();

        for seq in group.running_sequences() {
            let num_physical = self.block_tables.get(&seq.id()).map_or(0, Vec::len);
            if num_logical > num_physical {
                // a shared tail must be split before this branch diverges
                // into its new blocks
                if num_physical > 0 {
                    let tail = *self.block_tables[&seq.id()]
                        .last()
                        .expect("tables are never empty");
                    if self.allocator.block(tail).copy_on_write() {
                        let fresh = self.fork_tail_block(seq, group, num_physical);
                        copy_plan.entry(tail).or_default().push(fresh);
                    }
                }
                self.allocate(seq, num_logical - num_physical, group.prompt_ids());
            } else {
                assert_eq!(
                    num_logical, num_physical,
                    "physical blocks must not outnumber logical blocks when appending"
                );
                let tail = *self
                    .block_tables
                    .get(&seq.id())
                    .expect("sequence has no block table to append to")
                    .last()
                    .expect("tables are never empty");
                if self.allocator.block(tail).copy_on_write() {
                    let fresh = self.fork_tail_block(seq, group, num_physical);
                    copy_plan.entry(tail).or_default().push(fresh);
                } else if self.enable_prefix_caching {
                    // sole owner: keep the live index tracking the tail's
                    // grown content
                    self.reindex_tail(seq, group, tail);
                }
            }
        }
        copy_plan
    }

    /// Replace the sequence's tail slot with a fresh block (indexed under
    /// the prefix the tail covers) and release the shared original.
    fn fork_tail_block(
        &mut self,
        seq: &Sequence,
        group: &SequenceGroup,
        num_physical: usize,
    ) -> BlockId {
        let covered =
            (num_physical * self.block_size).min(group.prompt_ids().len() + seq.generated_len());
        let fresh = if self.enable_prefix_caching {
            self.allocator
                .allocate_indexed(
                    &mut self.live_index,
                    group.prompt_ids(),
                    seq.generated_ids(),
                    covered,
                )
                .expect("admission checked by can_append_slots")
        } else {
            self.allocator.allocate_plain()
        };
        let table = self
            .block_tables
            .get_mut(&seq.id())
            .expect("sequence has no block table");
        let old = std::mem::replace(table.last_mut().expect("tables are never empty"), fresh);
        self.allocator.free(old);
        fresh
    }

    /// Erase the tail's old content key and re-insert it under the
    /// sequence's current `(prompt ++ generated)` prefix.
    fn reindex_tail(&mut self, seq: &Sequence, group: &SequenceGroup, tail: BlockId) {
        let total = group.prompt_ids().len() + seq.generated_len();
        let content = block_content(group.prompt_ids(), seq.generated_ids(), total);
        if self.live_index.lookup(self.allocator.block(tail).content()) == Some(tail) {
            self.live_index.erase(self.allocator.block(tail).content());
        }
        self.live_index.insert(&content, tail);
        self.allocator.block_mut(tail).set_content(content);
    }

    /// Re-acquire cached blocks for a new request's prompt, walking it in
    /// block-sized windows. An exact content hit attaches the block and
    /// advances the group's processed-token counter; the first window
    /// without an exact hit gets one partial attempt and ends restoration.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        let unprocessed: Vec<SeqId> = group.active_sequences().map(Sequence::id).collect();
        assert_eq!(
            unprocessed.len(),
            1,
            "restoration expects a group with exactly one unprocessed sequence"
        );
        let seq_id = unprocessed[0];
        let prompt = group.prompt_ids().to_vec();

        let mut hits = 0usize;
        let mut probes = 0usize;
        let mut content_len = 0usize;
        while content_len < prompt.len() {
            let prev = content_len;
            content_len = (prev + self.block_size).min(prompt.len());
            probes += 1;

            if let Some(id) = self
                .allocator
                .lookup_cached(&self.live_index, &prompt[..content_len])
            {
                self.block_tables.entry(seq_id).or_default().push(id);
                group.update_processed_tokens_num(content_len);
                hits += 1;
                continue;
            }

            if let Some((id, matched)) = self.restore_partial_block(&prompt, prev, content_len) {
                self.block_tables.entry(seq_id).or_default().push(id);
                group.update_processed_tokens_num(matched);
                hits += 1;
            }
            break;
        }

        self.metrics.record_cache_query(hits, probes - hits);
        tracing::debug!(
            seq_id,
            restored_blocks = hits,
            processed_tokens = group.num_processed_tokens(),
            "prompt restoration finished"
        );
    }

    /// Partial fill of the window `[prev, window_end)`: first a cached or
    /// live block whose content stops at an exact shorter length, then a
    /// cached block whose content extends the prompt, truncated to the
    /// matched slice and re-indexed.
    fn restore_partial_block(
        &mut self,
        prompt: &[TokenId],
        prev: usize,
        window_end: usize,
    ) -> Option<(BlockId, usize)> {
        for len in prev + 1..prev + self.block_size {
            if len > prompt.len() {
                break;
            }
            if let Some(id) = self.allocator.lookup_cached(&self.live_index, &prompt[..len]) {
                return Some((id, len));
            }
        }

        let (id, matched) = self
            .allocator
            .lookup_cached_prefix(&prompt[..window_end], prev)?;
        let content = prompt[..matched].to_vec();
        if self.live_index.lookup(self.allocator.block(id).content()) == Some(id) {
            self.live_index.erase(self.allocator.block(id).content());
        }
        self.live_index.insert(&content, id);
        self.allocator.block_mut(id).set_content(content);
        Some((id, matched))
    }

    /// Blocks attached to the group's not-finished sequences, counting
    /// tables that share a tail block only once.
    pub fn blocks_occupied_by_group(&self, group: &SequenceGroup) -> usize {
        let mut counted_tails: HashSet<BlockId> = HashSet::new();
        let mut total = 0;
        for seq in group.active_sequences() {
            let Some(table) = self.block_tables.get(&seq.id()) else {
                continue;
            };
            let tail = *table.last().expect("tables are never empty");
            if counted_tails.insert(tail) {
                total += table.len();
            }
        }
        total
    }
}
