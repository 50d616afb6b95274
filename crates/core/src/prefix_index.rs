//! Content-addressed index over token sequences.
//!
//! A trie keyed on the literal token sequence, branching over the
//! little-endian byte decomposition of each token id. Distinct sequences
//! never collapse to one node, so equality is by exact token content; there
//! is no hashing involved.

use std::collections::BTreeMap;

use crate::block::BlockId;
use crate::sequence::TokenId;

#[derive(Debug, Default)]
struct TrieNode {
    /// Ordered children keep traversal deterministic.
    children: BTreeMap<u8, TrieNode>,
    /// Terminal marker: the block whose content ends exactly here.
    block: Option<BlockId>,
}

#[derive(Debug, Default)]
pub struct PrefixIndex {
    root: TrieNode,
    len: usize,
}

fn key_bytes(tokens: &[TokenId]) -> impl Iterator<Item = u8> + '_ {
    tokens.iter().flat_map(|t| t.to_le_bytes())
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed sequences.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `block` at the terminal of the token path, overwriting any
    /// previous terminal for the same sequence.
    pub fn insert(&mut self, tokens: &[TokenId], block: BlockId) {
        let mut node = &mut self.root;
        for byte in key_bytes(tokens) {
            node = node.children.entry(byte).or_default();
        }
        if node.block.replace(block).is_none() {
            self.len += 1;
        }
    }

    /// Terminal at this exact depth, or `None`.
    pub fn lookup(&self, tokens: &[TokenId]) -> Option<BlockId> {
        let mut node = &self.root;
        for byte in key_bytes(tokens) {
            node = node.children.get(&byte)?;
        }
        node.block
    }

    /// Remove the terminal for this exact sequence and prune any suffix path
    /// left without terminals. Returns whether a terminal was removed.
    pub fn erase(&mut self, tokens: &[TokenId]) -> bool {
        let bytes: Vec<u8> = key_bytes(tokens).collect();
        let erased = Self::erase_rec(&mut self.root, &bytes);
        if erased {
            self.len -= 1;
        }
        erased
    }

    fn erase_rec(node: &mut TrieNode, bytes: &[u8]) -> bool {
        let Some((first, rest)) = bytes.split_first() else {
            return node.block.take().is_some();
        };
        let Some(child) = node.children.get_mut(first) else {
            return false;
        };
        let erased = Self::erase_rec(child, rest);
        if erased && child.block.is_none() && child.children.is_empty() {
            node.children.remove(first);
        }
        erased
    }

    /// Walk the byte path of `tokens` as deep as it exists and return the
    /// nearest indexed block at or below the deepest token-aligned node
    /// reached, together with how many query tokens that node covers.
    ///
    /// The returned block's content extends (or equals) the matched query
    /// prefix. Because erasure prunes empty paths, every surviving node has a
    /// terminal at or beneath it.
    pub(crate) fn lookup_extension(&self, tokens: &[TokenId]) -> Option<(BlockId, usize)> {
        let mut node = &self.root;
        let mut anchor: Option<(&TrieNode, usize)> = None;
        'walk: for (i, token) in tokens.iter().enumerate() {
            for byte in token.to_le_bytes() {
                match node.children.get(&byte) {
                    Some(child) => node = child,
                    None => break 'walk,
                }
            }
            anchor = Some((node, i + 1));
        }
        let (anchor, matched) = anchor?;
        Some((Self::nearest_terminal(anchor)?, matched))
    }

    fn nearest_terminal(node: &TrieNode) -> Option<BlockId> {
        if node.block.is_some() {
            return node.block;
        }
        node.children.values().find_map(Self::nearest_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_finds_nothing() {
        let index = PrefixIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.lookup(&[1, 2, 3]), None);
        assert_eq!(index.lookup(&[]), None);
    }

    #[test]
    fn insert_and_lookup_exact() {
        let mut index = PrefixIndex::new();
        index.insert(&[10, 11, 12], 7);
        assert_eq!(index.lookup(&[10, 11, 12]), Some(7));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn lookup_requires_exact_depth() {
        let mut index = PrefixIndex::new();
        index.insert(&[10, 11, 12, 13], 1);
        // both a shorter and a longer query must miss
        assert_eq!(index.lookup(&[10, 11, 12]), None);
        assert_eq!(index.lookup(&[10, 11, 12, 13, 14]), None);
    }

    #[test]
    fn nested_prefixes_coexist() {
        let mut index = PrefixIndex::new();
        index.insert(&[1, 2], 0);
        index.insert(&[1, 2, 3, 4], 1);
        assert_eq!(index.lookup(&[1, 2]), Some(0));
        assert_eq!(index.lookup(&[1, 2, 3, 4]), Some(1));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn insert_overwrites_terminal() {
        let mut index = PrefixIndex::new();
        index.insert(&[5, 6], 0);
        index.insert(&[5, 6], 9);
        assert_eq!(index.lookup(&[5, 6]), Some(9));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn distinct_tokens_do_not_collide() {
        // token ids sharing low bytes must stay distinct
        let mut index = PrefixIndex::new();
        index.insert(&[0x0102], 0);
        index.insert(&[0x01, 0x02], 1);
        assert_eq!(index.lookup(&[0x0102]), Some(0));
        assert_eq!(index.lookup(&[0x01, 0x02]), Some(1));
    }

    #[test]
    fn negative_token_ids_are_valid_keys() {
        let mut index = PrefixIndex::new();
        index.insert(&[-1, -2], 4);
        assert_eq!(index.lookup(&[-1, -2]), Some(4));
        assert_eq!(index.lookup(&[-1]), None);
    }

    #[test]
    fn erase_removes_terminal_only() {
        let mut index = PrefixIndex::new();
        index.insert(&[1, 2], 0);
        index.insert(&[1, 2, 3], 1);
        assert!(index.erase(&[1, 2]));
        assert_eq!(index.lookup(&[1, 2]), None);
        assert_eq!(index.lookup(&[1, 2, 3]), Some(1));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn erase_prunes_dangling_path() {
        let mut index = PrefixIndex::new();
        index.insert(&[1, 2, 3], 0);
        assert!(index.erase(&[1, 2, 3]));
        assert!(index.is_empty());
        // pruning left no phantom paths for the extension walk
        assert_eq!(index.lookup_extension(&[1, 2, 3]), None);
    }

    #[test]
    fn erase_of_missing_sequence_is_noop() {
        let mut index = PrefixIndex::new();
        index.insert(&[1, 2], 0);
        assert!(!index.erase(&[1, 9]));
        assert!(!index.erase(&[1, 2, 3]));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn extension_finds_longer_content() {
        let mut index = PrefixIndex::new();
        index.insert(&[10, 11, 12, 13], 2);
        // query is a strict prefix of the stored content
        assert_eq!(index.lookup_extension(&[10, 11, 12]), Some((2, 3)));
    }

    #[test]
    fn extension_reports_matched_token_count() {
        let mut index = PrefixIndex::new();
        index.insert(&[10, 11, 12, 13], 2);
        // path dies after the second token of the query
        assert_eq!(index.lookup_extension(&[10, 11, 99]), Some((2, 2)));
    }

    #[test]
    fn extension_misses_on_diverging_first_token() {
        let mut index = PrefixIndex::new();
        index.insert(&[10, 11], 0);
        assert_eq!(index.lookup_extension(&[20, 11]), None);
    }

    #[test]
    fn extension_prefers_exact_terminal() {
        let mut index = PrefixIndex::new();
        index.insert(&[1, 2], 0);
        index.insert(&[1, 2, 3], 1);
        assert_eq!(index.lookup_extension(&[1, 2]), Some((0, 2)));
    }
}
