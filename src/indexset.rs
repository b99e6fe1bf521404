/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Index sets: dense sets of integers that represent indices into a
//! space, used for per-block liveness.

use alloc::vec::Vec;
use core::fmt;

type Word = u64;
const BITS_PER_WORD: usize = Word::BITS as usize;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct IndexSet {
    words: Vec<Word>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    #[inline(always)]
    fn locate(idx: usize) -> (usize, Word) {
        (idx / BITS_PER_WORD, 1 << (idx % BITS_PER_WORD))
    }

    #[inline]
    pub fn set(&mut self, idx: usize, val: bool) {
        let (word, bit) = Self::locate(idx);
        if word >= self.words.len() {
            if !val {
                return;
            }
            self.words.resize(word + 1, 0);
        }
        if val {
            self.words[word] |= bit;
        } else {
            self.words[word] &= !bit;
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        let (word, bit) = Self::locate(idx);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    /// Adds every element of `other`; returns whether anything was added.
    pub fn union_with(&mut self, other: &IndexSet) -> bool {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (a, &b) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *a | b;
            changed |= merged != *a;
            *a = merged;
        }
        changed
    }

    /// Iterates over the members in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            let mut rest = w;
            core::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(i * BITS_PER_WORD + bit)
            })
        })
    }
}

impl fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::IndexSet;
    use alloc::vec;
    use alloc::vec::Vec;

    #[test]
    fn set_get_iter() {
        let mut set = IndexSet::new();
        set.set(3, true);
        set.set(130, true);
        set.set(64, true);
        assert!(set.get(3));
        assert!(set.get(130));
        assert!(!set.get(4));
        assert!(!set.get(100_000));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64, 130]);
        set.set(64, false);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 130]);
    }

    #[test]
    fn union_reports_growth() {
        let mut a = IndexSet::new();
        let mut b = IndexSet::new();
        a.set(1, true);
        b.set(1, true);
        assert!(!a.union_with(&b));
        b.set(200, true);
        assert!(a.union_with(&b));
        assert!(a.get(200));
        assert!(!a.union_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 200]);
    }
}
