//! Retention pool for freed blocks when prefix caching is enabled.
//!
//! Cached blocks are held in two structures that every mutation updates
//! together: a tick-ordered map for LRU victim selection and a private
//! [`PrefixIndex`] for content lookup. The evictor owns the logical clock
//! that stamps blocks on every transition through it; ticks are unique, so
//! LRU order needs no tie-breaking.

use std::collections::{BTreeMap, HashMap};

use crate::block::{BlockId, KVCacheBlock};
use crate::prefix_index::PrefixIndex;
use crate::sequence::TokenId;

#[derive(Debug, Default)]
pub struct Evictor {
    by_tick: BTreeMap<u64, BlockId>,
    tick_of: HashMap<BlockId, u64>,
    index: PrefixIndex,
    clock: u64,
}

impl Evictor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn len(&self) -> usize {
        self.by_tick.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tick.is_empty()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.tick_of.contains_key(&block_id)
    }

    /// Take a freed block into retention, indexed under its current content.
    pub(crate) fn add(&mut self, block: &mut KVCacheBlock) {
        assert!(
            block.is_free(),
            "block {} entered the evictor while still referenced",
            block.index()
        );
        let tick = self.next_tick();
        block.set_timestamp(tick);
        self.index.insert(block.content(), block.index());
        self.by_tick.insert(tick, block.index());
        self.tick_of.insert(block.index(), tick);
    }

    /// Remove and return the block whose content equals `tokens` exactly.
    /// The block leaves with ref_count 1 and a fresh timestamp.
    pub(crate) fn take_by_content(
        &mut self,
        blocks: &mut [KVCacheBlock],
        tokens: &[TokenId],
    ) -> Option<BlockId> {
        let id = self.index.lookup(tokens)?;
        debug_assert!(self.tick_of.contains_key(&id));
        self.index.erase(tokens);
        self.detach_and_revive(blocks, id);
        Some(id)
    }

    /// Remove and return a block whose content extends a prefix of `tokens`
    /// longer than `min_tokens`, together with the matched token count. The
    /// caller owns rewriting the block's content to the matched slice.
    pub(crate) fn take_by_prefix(
        &mut self,
        blocks: &mut [KVCacheBlock],
        tokens: &[TokenId],
        min_tokens: usize,
    ) -> Option<(BlockId, usize)> {
        let (id, matched) = self.index.lookup_extension(tokens)?;
        if matched <= min_tokens {
            return None;
        }
        debug_assert!(self.tick_of.contains_key(&id));
        self.erase_indexed_content(blocks, id);
        self.detach_and_revive(blocks, id);
        Some((id, matched))
    }

    /// Remove and return the least recently used block, or `None` when empty.
    pub(crate) fn take_lru(&mut self, blocks: &mut [KVCacheBlock]) -> Option<BlockId> {
        if self.is_empty() {
            return None;
        }
        let (_, id) = self.by_tick.pop_first().expect("checked above");
        self.tick_of.remove(&id);
        self.erase_indexed_content(blocks, id);
        let tick = self.next_tick();
        blocks[id].set_timestamp(tick);
        blocks[id].increment();
        Some(id)
    }

    /// Drop the index entry for this block's content, but only while the
    /// entry still points at it: a newer block indexed under identical
    /// content must not be unlinked (content equality is not identity).
    fn erase_indexed_content(&mut self, blocks: &[KVCacheBlock], id: BlockId) {
        if self.index.lookup(blocks[id].content()) == Some(id) {
            self.index.erase(blocks[id].content());
        }
    }

    fn detach_and_revive(&mut self, blocks: &mut [KVCacheBlock], id: BlockId) {
        if let Some(tick) = self.tick_of.remove(&id) {
            self.by_tick.remove(&tick);
        }
        let tick = self.next_tick();
        blocks[id].set_timestamp(tick);
        blocks[id].increment();
    }
}
