//! Growable bit vector used for archetype schemas, query predicates and the
//! per-entity bookkeeping of the command buffer.
//!
//! Bit `i` set means "component (or tag, or entity slot) `i` is present". Two
//! masks compare equal when they have the same set bits, regardless of how many
//! trailing zero words either one happens to carry.

use std::fmt;
use std::hash::{Hash, Hasher};

const WORD_BITS: usize = 64;

/// A resizable array of 64-bit words.
#[derive(Clone, Default)]
pub struct BitMask {
    words: Vec<u64>,
}

impl BitMask {
    /// Create an empty mask.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Build a mask with exactly the given bits set.
    pub fn from_bits(bits: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::new();
        for bit in bits {
            mask.set(bit);
        }
        mask
    }

    #[inline]
    fn split(bit: usize) -> (usize, u64) {
        (bit / WORD_BITS, 1u64 << (bit % WORD_BITS))
    }

    fn ensure_word(&mut self, word: usize) {
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
    }

    /// Set bit `bit`, growing the mask if needed.
    pub fn set(&mut self, bit: usize) {
        let (word, m) = Self::split(bit);
        self.ensure_word(word);
        self.words[word] |= m;
    }

    /// Clear bit `bit`. Clearing a bit beyond the current length is a no-op.
    pub fn clear(&mut self, bit: usize) {
        let (word, m) = Self::split(bit);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !m;
        }
    }

    /// Flip bit `bit` and return its new value.
    pub fn flip(&mut self, bit: usize) -> bool {
        let (word, m) = Self::split(bit);
        self.ensure_word(word);
        self.words[word] ^= m;
        self.words[word] & m != 0
    }

    /// Whether bit `bit` is set.
    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        let (word, m) = Self::split(bit);
        self.words.get(word).is_some_and(|w| w & m != 0)
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `true` if every bit set in `self` is also set in `other`.
    ///
    /// An empty mask is trivially contained in anything.
    pub fn all_set_in(&self, other: &BitMask) -> bool {
        self.words.iter().enumerate().all(|(i, &w)| {
            let o = other.words.get(i).copied().unwrap_or(0);
            w & o == w
        })
    }

    /// `true` if at least one bit set in `self` is also set in `other`.
    pub fn any_set_in(&self, other: &BitMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(&a, &b)| a & b != 0)
    }

    /// In-place union.
    pub fn or_with(&mut self, other: &BitMask) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, &b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }

    /// Iterate set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let tz = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * WORD_BITS + tz)
            })
        })
    }

    /// Raw backing words (may include trailing zero words).
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    fn significant_words(&self) -> &[u64] {
        let len = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |p| p + 1);
        &self.words[..len]
    }
}

impl PartialEq for BitMask {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for BitMask {}

impl Hash for BitMask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl fmt::Debug for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter_ones()).finish()
    }
}

impl FromIterator<usize> for BitMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_bits(iter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
