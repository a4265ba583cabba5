//! Per-archetype column access negotiation.
//!
//! Each column of an archetype owns one atomic state word:
//!
//! | State | Meaning |
//! |------:|--------|
//! | `0` | free |
//! | `1` | one writer |
//! | `>= 2` | `state - 1` readers |
//!
//! A scan declares the columns it reads and the columns it writes and acquires
//! them together through an [`AccessGuard`]. Columns are taken in ascending
//! index order, so two scans can never each hold a column the other waits on.
//! Waiting is a busy spin that yields to the OS scheduler every 1024 spins; it
//! is not a blocking primitive and has no timeout.
//!
//! Re-acquiring a column the current thread already writes deadlocks.

use std::sync::atomic::{AtomicUsize, Ordering};

const FREE: usize = 0;
const WRITER: usize = 1;

#[inline]
fn backoff(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if *spins % 1024 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Access states for every column of one archetype.
#[derive(Debug)]
pub(crate) struct ColumnBorrows {
    states: Box<[AtomicUsize]>,
}

impl ColumnBorrows {
    pub fn new(columns: usize) -> Self {
        Self {
            states: (0..columns).map(|_| AtomicUsize::new(FREE)).collect(),
        }
    }

    fn acquire_read(&self, column: usize) {
        let state = &self.states[column];
        let mut spins = 0u32;
        loop {
            let current = state.load(Ordering::Acquire);
            if current != WRITER {
                let next = if current == FREE { 2 } else { current + 1 };
                if state
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            backoff(&mut spins);
        }
    }

    fn release_read(&self, column: usize) {
        let result = self.states[column].fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            debug_assert!(s >= 2, "releasing a read that was never taken");
            Some(if s == 2 { FREE } else { s - 1 })
        });
        debug_assert!(result.is_ok());
    }

    fn acquire_write(&self, column: usize) {
        let state = &self.states[column];
        let mut spins = 0u32;
        while state
            .compare_exchange_weak(FREE, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut spins);
        }
    }

    fn release_write(&self, column: usize) {
        let previous = self.states[column].swap(FREE, Ordering::AcqRel);
        debug_assert_eq!(previous, WRITER);
    }

    /// Whether no column is currently held.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.states
            .iter()
            .all(|s| s.load(Ordering::Acquire) == FREE)
    }

    /// Whether `column` is currently being written.
    #[cfg(test)]
    pub fn is_written(&self, column: usize) -> bool {
        self.states[column].load(Ordering::Acquire) == WRITER
    }

    /// Take read access to `reads` and write access to `writes`, spinning
    /// until every column is available. A column listed in both is written.
    pub fn acquire<'a>(&'a self, reads: &[usize], writes: &[usize]) -> AccessGuard<'a> {
        let mut writes = writes.to_vec();
        writes.sort_unstable();
        writes.dedup();
        let mut reads: Vec<usize> = reads
            .iter()
            .copied()
            .filter(|c| writes.binary_search(c).is_err())
            .collect();
        reads.sort_unstable();
        reads.dedup();

        let mut order: Vec<(usize, bool)> = reads
            .iter()
            .map(|&c| (c, false))
            .chain(writes.iter().map(|&c| (c, true)))
            .collect();
        order.sort_unstable();
        for &(column, write) in &order {
            if write {
                self.acquire_write(column);
            } else {
                self.acquire_read(column);
            }
        }

        AccessGuard {
            borrows: self,
            reads,
            writes,
        }
    }
}

/// RAII access to a set of columns. Released on drop.
#[derive(Debug)]
pub(crate) struct AccessGuard<'a> {
    borrows: &'a ColumnBorrows,
    reads: Vec<usize>,
    writes: Vec<usize>,
}

impl AccessGuard<'_> {
    pub fn reads(&self, column: usize) -> bool {
        self.reads.binary_search(&column).is_ok()
    }

    pub fn writes(&self, column: usize) -> bool {
        self.writes.binary_search(&column).is_ok()
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        for &c in &self.writes {
            self.borrows.release_write(c);
        }
        for &c in &self.reads {
            self.borrows.release_read(c);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
