//! Choice over fixed token sequences

use crate::error::{Error, Result};
use crate::types::TokenId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: BTreeMap<TokenId, u32>,
    terminal: bool,
}

/// Prefix tree of allowed token sequences
#[derive(Debug, Clone)]
pub struct TokenTrie {
    nodes: Vec<TrieNode>,
}

impl TokenTrie {
    /// Build a trie; every sequence must be non-empty
    pub fn new(sequences: &[Vec<TokenId>]) -> Result<Self> {
        if sequences.is_empty() {
            return Err(Error::InvalidGrammar("token choice has no sequences".into()));
        }
        let mut nodes = vec![TrieNode::default()];
        for sequence in sequences {
            if sequence.is_empty() {
                return Err(Error::InvalidGrammar("token sequence is empty".into()));
            }
            let mut node = 0usize;
            for &token in sequence {
                let existing = nodes[node].children.get(&token).copied();
                node = match existing {
                    Some(child) => child as usize,
                    None => {
                        nodes.push(TrieNode::default());
                        let child = nodes.len() - 1;
                        nodes[node].children.insert(token, child as u32);
                        child
                    }
                };
            }
            nodes[node].terminal = true;
        }
        Ok(Self { nodes })
    }

    /// Root node
    pub fn root(&self) -> u32 {
        0
    }

    /// Follow one token
    pub fn step(&self, node: u32, token: TokenId) -> Option<u32> {
        self.nodes.get(node as usize)?.children.get(&token).copied()
    }

    /// Tokens that may follow
    pub fn next_tokens(&self, node: u32) -> impl Iterator<Item = TokenId> + '_ {
        self.nodes
            .get(node as usize)
            .into_iter()
            .flat_map(|n| n.children.keys().copied())
    }

    /// Whether a complete sequence ends here
    pub fn is_terminal(&self, node: u32) -> bool {
        self.nodes.get(node as usize).is_some_and(|n| n.terminal)
    }

    /// Whether no token may follow
    pub fn is_leaf(&self, node: u32) -> bool {
        self.nodes
            .get(node as usize)
            .map_or(true, |n| n.children.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_prefixes() {
        let trie = TokenTrie::new(&[vec![1, 2, 3], vec![1, 2], vec![4]]).unwrap();
        let root = trie.root();
        assert_eq!(trie.next_tokens(root).collect::<Vec<_>>(), vec![1, 4]);

        let n = trie.step(root, 1).and_then(|n| trie.step(n, 2)).unwrap();
        assert!(trie.is_terminal(n));
        assert!(!trie.is_leaf(n));
        assert_eq!(trie.next_tokens(n).collect::<Vec<_>>(), vec![3]);

        let end = trie.step(n, 3).unwrap();
        assert!(trie.is_leaf(end));
        assert!(trie.step(root, 2).is_none());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(TokenTrie::new(&[]).is_err());
        assert!(TokenTrie::new(&[vec![]]).is_err());
    }
}
