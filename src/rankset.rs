//! Ordered participant sets over a fixed range `[0, N)`
//!
//! # Design
//!
//! Almost every set the replay records is either a singleton (the peer of a
//! point-to-point message) or the full communicator (barriers, init). Both
//! cases stay allocation-free:
//!
//! ```text
//! Sparse(None)      -> {}
//! Sparse(Some(k))   -> {k}
//! Dense(None)       -> {0 .. N-1}
//! Dense(Some(k))    -> {0 .. N-1} \ {k}
//! Bitmap(words)     -> anything else, shared until mutated
//! ```
//!
//! The bitmap is an `Arc<Vec<u64>>`; mutation goes through `Arc::make_mut`
//! so clones share storage until one of them changes. Every mutating
//! operation renormalizes into the smallest representation.

use std::fmt;
use std::sync::Arc;

const WORD: usize = 64;

#[derive(Clone)]
enum Repr {
    Sparse(Option<usize>),
    Dense(Option<usize>),
    Bitmap(Arc<Vec<u64>>),
}

#[derive(Clone)]
pub struct RankSet {
    size: usize,
    repr: Repr,
}

impl RankSet {
    /// Empty set over `[0, size)`
    pub fn new(size: usize) -> Self {
        RankSet {
            size,
            repr: Repr::Sparse(None),
        }
    }

    /// Full set over `[0, size)`
    pub fn full(size: usize) -> Self {
        let mut set = RankSet::new(size);
        set.fill();
        set
    }

    pub fn singleton(size: usize, rank: usize) -> Self {
        let mut set = RankSet::new(size);
        set.insert(rank);
        set
    }

    pub fn from_ranks(size: usize, ranks: impl IntoIterator<Item = usize>) -> Self {
        let mut set = RankSet::new(size);
        for rank in ranks {
            set.insert(rank);
        }
        set
    }

    /// Upper bound `N` of the range
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn contains(&self, rank: usize) -> bool {
        if rank >= self.size {
            return false;
        }
        match &self.repr {
            Repr::Sparse(entry) => *entry == Some(rank),
            Repr::Dense(missing) => *missing != Some(rank),
            Repr::Bitmap(words) => words[rank / WORD] & (1 << (rank % WORD)) != 0,
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Sparse(entry) => entry.is_some() as usize,
            Repr::Dense(missing) => self.size - missing.is_some() as usize,
            Repr::Bitmap(words) => words.iter().map(|w| w.count_ones() as usize).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.size
    }

    /// Insert `rank`; returns whether the set changed.
    ///
    /// Ranks outside the range are ignored.
    pub fn insert(&mut self, rank: usize) -> bool {
        if rank >= self.size || self.contains(rank) {
            return false;
        }
        match &mut self.repr {
            Repr::Sparse(entry @ None) => *entry = Some(rank),
            Repr::Dense(missing) => *missing = None,
            _ => {
                self.bits_mut()[rank / WORD] |= 1 << (rank % WORD);
                self.normalize();
            }
        }
        true
    }

    /// Erase `rank`; returns whether the set changed.
    pub fn erase(&mut self, rank: usize) -> bool {
        if !self.contains(rank) {
            return false;
        }
        match &mut self.repr {
            Repr::Sparse(entry) => *entry = None,
            Repr::Dense(missing @ None) => *missing = Some(rank),
            _ => {
                self.bits_mut()[rank / WORD] &= !(1 << (rank % WORD));
                self.normalize();
            }
        }
        true
    }

    pub fn fill(&mut self) {
        self.repr = Repr::Dense(None);
    }

    pub fn clear(&mut self) {
        self.repr = Repr::Sparse(None);
    }

    /// `self ∩= other`
    pub fn intersect_with(&mut self, other: &RankSet) {
        match (&self.repr, &other.repr) {
            (_, Repr::Dense(None)) | (Repr::Sparse(None), _) => {}
            (Repr::Sparse(Some(k)), _) => {
                if !other.contains(*k) {
                    self.clear();
                }
            }
            _ => self.combine(other, |a, b| a & b),
        }
    }

    /// `self ∪= other`
    pub fn union_with(&mut self, other: &RankSet) {
        match (&self.repr, &other.repr) {
            (Repr::Dense(None), _) | (_, Repr::Sparse(None)) => {}
            (_, Repr::Sparse(Some(k))) => {
                let k = *k;
                self.insert(k);
            }
            _ => self.combine(other, |a, b| a | b),
        }
    }

    /// `self \= other`
    pub fn difference_with(&mut self, other: &RankSet) {
        match (&self.repr, &other.repr) {
            (Repr::Sparse(None), _) | (_, Repr::Sparse(None)) => {}
            (_, Repr::Sparse(Some(k))) => {
                let k = *k;
                self.erase(k);
            }
            _ => self.combine(other, |a, b| a & !b),
        }
    }

    pub fn intersection(&self, other: &RankSet) -> RankSet {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    /// `self ⊇ other`, independent of either representation
    pub fn is_superset(&self, other: &RankSet) -> bool {
        match (&self.repr, &other.repr) {
            (_, Repr::Sparse(None)) => true,
            (_, Repr::Sparse(Some(k))) => self.contains(*k),
            (Repr::Dense(None), _) => other.iter().all(|k| k < self.size),
            _ => other.iter().all(|k| self.contains(k)),
        }
    }

    /// Members in ascending order
    pub fn iter(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match &self.repr {
            Repr::Sparse(entry) => Box::new(entry.iter().copied()),
            _ => Box::new((0..self.size).filter(move |&k| self.contains(k))),
        }
    }

    /// Word-level view used for bitwise-or reductions across participants
    pub fn to_words(&self) -> Vec<u64> {
        let mut words = vec![0u64; self.size.div_ceil(WORD)];
        for k in self.iter() {
            words[k / WORD] |= 1 << (k % WORD);
        }
        words
    }

    pub fn from_words(size: usize, words: Vec<u64>) -> Self {
        let mut words = words;
        words.resize(size.div_ceil(WORD), 0);
        if let Some(last) = words.last_mut() {
            let used = size % WORD;
            if used != 0 {
                *last &= (1u64 << used) - 1;
            }
        }
        let mut set = RankSet {
            size,
            repr: Repr::Bitmap(Arc::new(words)),
        };
        set.normalize();
        set
    }

    fn combine(&mut self, other: &RankSet, op: impl Fn(u64, u64) -> u64) {
        let theirs = other.to_words();
        let bits = self.bits_mut();
        for (mine, their) in bits.iter_mut().zip(theirs.iter().chain(std::iter::repeat(&0))) {
            *mine = op(*mine, *their);
        }
        // Dense complements may have set padding bits.
        let size = self.size;
        let used = size % WORD;
        if used != 0 {
            if let Some(last) = self.bits_mut().last_mut() {
                *last &= (1u64 << used) - 1;
            }
        }
        self.normalize();
    }

    /// Switch to the bitmap representation and return its unshared words
    fn bits_mut(&mut self) -> &mut Vec<u64> {
        if !matches!(self.repr, Repr::Bitmap(_)) {
            self.repr = Repr::Bitmap(Arc::new(self.to_words()));
        }
        match &mut self.repr {
            Repr::Bitmap(words) => Arc::make_mut(words),
            _ => unreachable!("representation switched to bitmap above"),
        }
    }

    fn normalize(&mut self) {
        let Repr::Bitmap(_) = self.repr else {
            return;
        };
        let count = self.len();
        if count == 0 {
            self.repr = Repr::Sparse(None);
        } else if count == 1 {
            let first = self.iter().next();
            self.repr = Repr::Sparse(first);
        } else if count == self.size {
            self.repr = Repr::Dense(None);
        } else if count + 1 == self.size {
            let missing = (0..self.size).find(|&k| !self.contains(k));
            self.repr = Repr::Dense(missing);
        }
    }

    #[cfg(test)]
    fn is_bitmap(&self) -> bool {
        matches!(self.repr, Repr::Bitmap(_))
    }
}

impl PartialEq for RankSet {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.iter().eq(other.iter())
    }
}

impl Eq for RankSet {}

impl fmt::Debug for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_and_full_stay_compact() {
        let mut set = RankSet::new(100);
        set.insert(42);
        assert!(!set.is_bitmap());
        assert!(set.contains(42));
        assert_eq!(set.len(), 1);

        let mut full = RankSet::full(100);
        full.erase(7);
        assert!(!full.is_bitmap());
        assert!(!full.contains(7));
        assert!(full.contains(8));
        assert_eq!(full.len(), 99);
    }

    #[test]
    fn test_bitmap_normalizes_back() {
        let mut set = RankSet::new(10);
        set.insert(1);
        set.insert(2);
        assert!(set.is_bitmap());
        set.erase(1);
        assert!(!set.is_bitmap());
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_fill_then_erase() {
        let mut set = RankSet::new(5);
        set.fill();
        set.erase(3);
        assert!(!set.contains(3));
        for j in [0, 1, 2, 4] {
            assert!(set.contains(j));
        }
    }

    #[test]
    fn test_clone_on_mutate() {
        let mut a = RankSet::from_ranks(10, [1, 3, 5]);
        let b = a.clone();
        a.insert(7);
        assert!(a.contains(7));
        assert!(!b.contains(7));
    }

    #[test]
    fn test_set_algebra() {
        let a = RankSet::from_ranks(8, [0, 1, 2, 3]);
        let b = RankSet::from_ranks(8, [2, 3, 4]);

        assert_eq!(a.intersection(&b), RankSet::from_ranks(8, [2, 3]));

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u, RankSet::from_ranks(8, 0..5));

        let mut d = a.clone();
        d.difference_with(&b);
        assert_eq!(d, RankSet::from_ranks(8, [0, 1]));

        let mut full = RankSet::full(8);
        full.difference_with(&RankSet::singleton(8, 6));
        assert_eq!(full.len(), 7);
    }

    #[test]
    fn test_superset_across_representations() {
        let full = RankSet::full(8);
        let missing = {
            let mut s = RankSet::full(8);
            s.erase(2);
            s
        };
        let bits = RankSet::from_ranks(8, [1, 4, 6]);
        let empty = RankSet::new(8);

        assert!(full.is_superset(&missing));
        assert!(!missing.is_superset(&full));
        assert!(missing.is_superset(&bits));
        assert!(!bits.is_superset(&missing));
        assert!(bits.is_superset(&bits));
        assert!(empty.is_superset(&empty));
        assert!(bits.is_superset(&empty));
    }

    #[test]
    fn test_words_round_trip_masks_padding() {
        let set = RankSet::from_words(3, vec![u64::MAX]);
        assert!(set.is_full());
        assert_eq!(set.to_words(), vec![0b111]);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut set = RankSet::new(4);
        assert!(!set.insert(4));
        assert!(!set.contains(4));
        assert!(set.is_empty());
    }
}
