//! Dense/sparse index structure.
//!
//! A [`SparseSet`] maps a sparse `u32` key (an entity slot, a component id) to
//! a value stored in a packed dense array. Insert, lookup and removal are all
//! O(1); removal swaps the last dense entry into the hole.

const EMPTY: u32 = u32::MAX;

/// Packed storage keyed by small integers.
#[derive(Debug, Clone)]
pub struct SparseSet<T> {
    /// key -> dense index, `EMPTY` when absent.
    sparse: Vec<u32>,
    /// dense index -> key.
    keys: Vec<u32>,
    /// dense index -> value.
    values: Vec<T>,
}

impl<T> SparseSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Number of stored entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    fn dense_index(&self, key: u32) -> Option<usize> {
        match self.sparse.get(key as usize) {
            Some(&d) if d != EMPTY => Some(d as usize),
            _ => None,
        }
    }

    /// Whether `key` has a value.
    #[inline]
    pub fn contains(&self, key: u32) -> bool {
        self.dense_index(key).is_some()
    }

    /// Insert or replace the value for `key`, returning the previous value.
    pub fn insert(&mut self, key: u32, value: T) -> Option<T> {
        if let Some(d) = self.dense_index(key) {
            return Some(std::mem::replace(&mut self.values[d], value));
        }
        let k = key as usize;
        if k >= self.sparse.len() {
            self.sparse.resize(k + 1, EMPTY);
        }
        self.sparse[k] = self.values.len() as u32;
        self.keys.push(key);
        self.values.push(value);
        None
    }

    /// Borrow the value for `key`.
    pub fn get(&self, key: u32) -> Option<&T> {
        self.dense_index(key).map(|d| &self.values[d])
    }

    /// Mutably borrow the value for `key`.
    pub fn get_mut(&mut self, key: u32) -> Option<&mut T> {
        self.dense_index(key).map(|d| &mut self.values[d])
    }

    /// Remove and return the value for `key`.
    pub fn remove(&mut self, key: u32) -> Option<T> {
        let d = self.dense_index(key)?;
        let last = self.values.len() - 1;
        if d != last {
            let moved_key = self.keys[last];
            self.sparse[moved_key as usize] = d as u32;
        }
        self.sparse[key as usize] = EMPTY;
        self.keys.swap_remove(d);
        Some(self.values.swap_remove(d))
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        for &k in &self.keys {
            self.sparse[k as usize] = EMPTY;
        }
        self.keys.clear();
        self.values.clear();
    }

    /// Keys in dense order.
    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    /// `(key, value)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.keys.iter().copied().zip(self.values.iter())
    }
}

impl<T> Default for SparseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
