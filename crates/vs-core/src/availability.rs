//! Interval bookkeeping for partially received blocks.
//!
//! An `AvailabilityMap` starts with a single missing interval `[0, N)` and
//! shrinks it as byte ranges arrive. Received ranges must fall entirely inside
//! one missing interval; anything else (out of bounds, zero length, overlap
//! with already received bytes) is rejected and leaves the map untouched.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::{Add, Sub};

use thiserror::Error;

/// Unsigned offset types usable as map coordinates.
pub trait Offset: Copy + Ord + Debug + Add<Output = Self> + Sub<Output = Self> {
    const ZERO: Self;
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn as_u64(self) -> u64;
}

macro_rules! impl_offset {
    ($($t:ty),*) => {
        $(impl Offset for $t {
            const ZERO: Self = 0;
            fn checked_add(self, rhs: Self) -> Option<Self> {
                <$t>::checked_add(self, rhs)
            }
            fn as_u64(self) -> u64 {
                self as u64
            }
        })*
    };
}

impl_offset!(u32, u64, usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AvailabilityError {
    #[error("zero-length range")]
    Empty,
    #[error("range {offset}+{len} exceeds size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("range {offset}+{len} overlaps received data")]
    Overlap { offset: u64, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityMap<T: Offset> {
    size: T,
    /// start -> length of each missing interval
    missing: BTreeMap<T, T>,
    size_left: T,
}

impl<T: Offset> AvailabilityMap<T> {
    pub fn new(size: T) -> Self {
        let mut missing = BTreeMap::new();
        if size > T::ZERO {
            missing.insert(T::ZERO, size);
        }
        Self {
            size,
            missing,
            size_left: size,
        }
    }

    pub fn size(&self) -> T {
        self.size
    }

    /// Bytes not yet received.
    pub fn size_left(&self) -> T {
        self.size_left
    }

    /// True once every byte has been received.
    pub fn full(&self) -> bool {
        self.missing.is_empty()
    }

    /// True while nothing has been received yet.
    pub fn empty(&self) -> bool {
        self.size_left == self.size
    }

    /// Locate the missing interval that wholly contains `[offset, offset+len)`.
    fn containing(&self, offset: T, len: T) -> Result<(T, T), AvailabilityError> {
        let err_args = (offset.as_u64(), len.as_u64());
        if len == T::ZERO {
            return Err(AvailabilityError::Empty);
        }
        let end = match offset.checked_add(len) {
            Some(end) if end <= self.size => end,
            _ => {
                return Err(AvailabilityError::OutOfBounds {
                    offset: err_args.0,
                    len: err_args.1,
                    size: self.size.as_u64(),
                })
            }
        };
        let overlap = AvailabilityError::Overlap {
            offset: err_args.0,
            len: err_args.1,
        };
        let (&start, &ilen) = self.missing.range(..=offset).next_back().ok_or(overlap.clone())?;
        if start + ilen < end {
            return Err(overlap);
        }
        Ok((start, ilen))
    }

    /// Whether `insert(offset, len)` would be accepted.
    pub fn can_insert(&self, offset: T, len: T) -> bool {
        self.containing(offset, len).is_ok()
    }

    /// Like [`can_insert`](Self::can_insert), with the reason for refusal.
    pub fn check_insert(&self, offset: T, len: T) -> Result<(), AvailabilityError> {
        self.containing(offset, len).map(|_| ())
    }

    /// Mark `[offset, offset+len)` as received.
    pub fn insert(&mut self, offset: T, len: T) -> Result<(), AvailabilityError> {
        let (start, ilen) = self.containing(offset, len)?;
        let end = offset + len;
        let iend = start + ilen;

        self.missing.remove(&start);
        if offset > start {
            self.missing.insert(start, offset - start);
        }
        if iend > end {
            self.missing.insert(end, iend - end);
        }
        self.size_left = self.size_left - len;
        Ok(())
    }

    /// Forget everything received; the whole range is missing again.
    pub fn reset(&mut self) {
        *self = Self::new(self.size);
    }

    /// Missing intervals as `(offset, len)` in ascending offset order.
    pub fn missing(&self) -> impl Iterator<Item = (T, T)> + '_ {
        self.missing.iter().map(|(&o, &l)| (o, l))
    }

    pub fn first_missing(&self) -> Option<(T, T)> {
        self.missing().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_is_single_interval() {
        let map = AvailabilityMap::<u32>::new(100);
        assert_eq!(map.missing().collect::<Vec<_>>(), vec![(0, 100)]);
        assert!(map.empty());
        assert!(!map.full());
        assert_eq!(map.size_left(), 100);
    }

    #[test]
    fn test_zero_size_is_full() {
        let map = AvailabilityMap::<u64>::new(0);
        assert!(map.full());
        assert_eq!(map.first_missing(), None);
    }

    #[test]
    fn test_insert_middle_splits() {
        let mut map = AvailabilityMap::<u32>::new(100);
        map.insert(40, 20).unwrap();
        assert_eq!(map.missing().collect::<Vec<_>>(), vec![(0, 40), (60, 40)]);
        assert_eq!(map.size_left(), 80);
        assert!(!map.empty());
    }

    #[test]
    fn test_rejects_overlap_and_bounds() {
        let mut map = AvailabilityMap::<u32>::new(100);
        map.insert(10, 10).unwrap();
        let before = map.clone();

        assert_eq!(
            map.insert(15, 10),
            Err(AvailabilityError::Overlap { offset: 15, len: 10 })
        );
        assert!(matches!(map.insert(5, 10), Err(AvailabilityError::Overlap { .. })));
        assert!(matches!(map.insert(95, 10), Err(AvailabilityError::OutOfBounds { .. })));
        assert!(matches!(map.insert(u32::MAX, 2), Err(AvailabilityError::OutOfBounds { .. })));
        assert_eq!(map.insert(50, 0), Err(AvailabilityError::Empty));
        assert_eq!(map, before);
    }

    #[test]
    fn test_reset() {
        let mut map = AvailabilityMap::<u32>::new(10);
        map.insert(0, 10).unwrap();
        assert!(map.full());
        map.reset();
        assert!(map.empty());
        assert_eq!(map.size_left(), 10);
    }

    /// Split `[0, size)` at the given cut points into contiguous pieces.
    fn pieces(size: u32, mut cuts: Vec<u32>) -> Vec<(u32, u32)> {
        cuts.retain(|&c| c > 0 && c < size);
        cuts.sort_unstable();
        cuts.dedup();
        let mut out = Vec::new();
        let mut prev = 0;
        for c in cuts.into_iter().chain(std::iter::once(size)) {
            out.push((prev, c - prev));
            prev = c;
        }
        out
    }

    proptest! {
        #[test]
        fn prop_exact_cover_fills_once(
            size in 1u32..5000,
            cuts in proptest::collection::vec(0u32..5000, 0..20),
            order in proptest::collection::vec(any::<u32>(), 20),
        ) {
            let mut parts = pieces(size, cuts);
            // deterministic shuffle driven by `order`
            for i in (1..parts.len()).rev() {
                let j = (order[i % order.len()] as usize) % (i + 1);
                parts.swap(i, j);
            }

            let mut map = AvailabilityMap::new(size);
            let n = parts.len();
            for (i, (offset, len)) in parts.into_iter().enumerate() {
                let before = map.size_left();
                prop_assert!(!map.full());
                map.insert(offset, len).unwrap();
                prop_assert_eq!(map.size_left(), before - len);
                prop_assert_eq!(map.full(), i == n - 1);
            }
        }

        #[test]
        fn prop_overlap_leaves_map_unchanged(
            size in 2u32..2000,
            a in 0u32..2000,
            b in 0u32..2000,
        ) {
            let offset = a % (size - 1);
            let len = 1 + b % (size - offset);
            let mut map = AvailabilityMap::new(size);
            map.insert(offset, len).unwrap();
            let snapshot = map.clone();
            prop_assert!(map.insert(offset, 1).is_err());
            prop_assert_eq!(map, snapshot);
        }
    }
}
