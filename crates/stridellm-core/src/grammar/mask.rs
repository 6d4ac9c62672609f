//! Allowed-token bitset

use crate::types::TokenId;
use std::fmt;

/// Fixed-size bitset over the vocabulary
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenMask {
    words: Vec<u64>,
    vocab_size: usize,
}

impl TokenMask {
    /// Mask with no tokens allowed
    pub fn empty(vocab_size: usize) -> Self {
        Self {
            words: vec![0; vocab_size.div_ceil(64)],
            vocab_size,
        }
    }

    /// Mask with every token allowed
    pub fn full(vocab_size: usize) -> Self {
        let mut mask = Self::empty(vocab_size);
        for word in &mut mask.words {
            *word = u64::MAX;
        }
        mask.clear_tail();
        mask
    }

    /// Mask allowing exactly the given tokens (out-of-range IDs are ignored)
    pub fn from_tokens(vocab_size: usize, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        let mut mask = Self::empty(vocab_size);
        for token in tokens {
            mask.insert(token);
        }
        mask
    }

    fn clear_tail(&mut self) {
        let rem = self.vocab_size % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    /// Vocabulary size the mask covers
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Allow a token
    pub fn insert(&mut self, token: TokenId) {
        let idx = token as usize;
        if idx < self.vocab_size {
            self.words[idx / 64] |= 1 << (idx % 64);
        }
    }

    /// Disallow a token
    pub fn remove(&mut self, token: TokenId) {
        let idx = token as usize;
        if idx < self.vocab_size {
            self.words[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Whether a token is allowed
    pub fn contains(&self, token: TokenId) -> bool {
        let idx = token as usize;
        idx < self.vocab_size && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Number of allowed tokens
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no token is allowed
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Allow every token allowed by `other`
    pub fn union_with(&mut self, other: &TokenMask) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    /// Keep only tokens allowed by `other`
    pub fn intersect_with(&mut self, other: &TokenMask) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }

    /// Iterate over allowed tokens in ascending order
    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros();
                bits &= bits - 1;
                Some((w * 64 + tz as usize) as TokenId)
            })
        })
    }

    /// Highest-scoring allowed token
    pub fn argmax(&self, logits: &[f32]) -> Option<TokenId> {
        self.iter()
            .filter(|t| (*t as usize) < logits.len())
            .max_by(|a, b| logits[*a as usize].total_cmp(&logits[*b as usize]))
    }
}

impl fmt::Debug for TokenMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenMask")
            .field("vocab_size", &self.vocab_size)
            .field("allowed", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut mask = TokenMask::empty(130);
        assert!(mask.is_empty());
        mask.insert(0);
        mask.insert(64);
        mask.insert(129);
        mask.insert(500);
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(129));
        assert!(!mask.contains(500));

        mask.remove(64);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 129]);
    }

    #[test]
    fn test_full_mask_respects_vocab_size() {
        let mask = TokenMask::full(70);
        assert_eq!(mask.count(), 70);
        assert!(mask.contains(69));
        assert!(!mask.contains(70));
    }

    #[test]
    fn test_set_operations() {
        let mut a = TokenMask::from_tokens(10, [1, 2, 3]);
        let b = TokenMask::from_tokens(10, [3, 4]);
        let mut c = a.clone();
        a.union_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        c.intersect_with(&b);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_masked_argmax() {
        let mask = TokenMask::from_tokens(4, [0, 2]);
        let logits = [0.1, 9.0, 0.5, 3.0];
        assert_eq!(mask.argmax(&logits), Some(2));
        assert_eq!(TokenMask::empty(4).argmax(&logits), None);
    }
}
