/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Index newtypes and the arenas they address.

#[macro_export]
macro_rules! define_index {
    ($ix:ident, $storage:ident, $elem:ident) => {
        define_index!($ix);

        /// Arena of records addressed by a stable index.
        #[derive(Clone, Debug, Default)]
        pub struct $storage {
            storage: alloc::vec::Vec<$elem>,
        }

        impl $storage {
            #[inline(always)]
            pub fn with_capacity(n: usize) -> Self {
                Self {
                    storage: alloc::vec::Vec::with_capacity(n),
                }
            }

            #[inline(always)]
            pub fn len(&self) -> usize {
                self.storage.len()
            }

            #[inline(always)]
            pub fn iter(&self) -> impl Iterator<Item = &$elem> {
                self.storage.iter()
            }

            #[inline(always)]
            pub fn push(&mut self, value: $elem) -> $ix {
                let idx = $ix(self.storage.len() as u32);
                self.storage.push(value);
                idx
            }
        }

        impl core::ops::Index<$ix> for $storage {
            type Output = $elem;

            #[inline(always)]
            fn index(&self, i: $ix) -> &Self::Output {
                &self.storage[i.index()]
            }
        }

        impl core::ops::IndexMut<$ix> for $storage {
            #[inline(always)]
            fn index_mut(&mut self, i: $ix) -> &mut Self::Output {
                &mut self.storage[i.index()]
            }
        }
    };

    ($ix:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $ix(pub u32);
        impl $ix {
            #[inline(always)]
            pub fn new(i: usize) -> Self {
                Self(i as u32)
            }
            #[inline(always)]
            pub fn index(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
            #[inline(always)]
            pub fn invalid() -> Self {
                Self(u32::MAX)
            }
            #[inline(always)]
            pub fn is_valid(self) -> bool {
                self != Self::invalid()
            }
        }
    };
}

define_index!(Inst);
define_index!(Block);
define_index!(TraceId);

macro_rules! impl_is_invalid {
    ($($ix:ident),*) => {
        $(
            impl $ix {
                #[inline(always)]
                pub fn is_invalid(self) -> bool {
                    self == Self::invalid()
                }
            }
        )*
    };
}

impl_is_invalid!(Inst, Block, TraceId);

impl Inst {
    #[inline(always)]
    pub fn next(self) -> Inst {
        debug_assert!(self.is_valid());
        Self(self.0 + 1)
    }

    #[inline(always)]
    pub fn prev(self) -> Inst {
        debug_assert!(self.is_valid());
        Self(self.0 - 1)
    }
}

/// A half-open range of instructions, `[from, to)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct InstRange(Inst, Inst);

impl InstRange {
    #[inline(always)]
    pub fn new(from: Inst, to: Inst) -> Self {
        debug_assert!(from.index() <= to.index());
        InstRange(from, to)
    }

    #[inline(always)]
    pub fn first(self) -> Inst {
        debug_assert!(!self.is_empty());
        self.0
    }

    #[inline(always)]
    pub fn last(self) -> Inst {
        debug_assert!(!self.is_empty());
        self.1.prev()
    }

    /// The range without its first instruction.
    #[inline(always)]
    pub fn rest(self) -> InstRange {
        debug_assert!(!self.is_empty());
        InstRange(self.0.next(), self.1)
    }

    #[inline(always)]
    pub fn len(self) -> usize {
        self.1.index() - self.0.index()
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == self.1
    }

    #[inline(always)]
    pub fn contains(self, inst: Inst) -> bool {
        self.0 <= inst && inst < self.1
    }

    #[inline(always)]
    pub fn iter(self) -> impl DoubleEndedIterator<Item = Inst> {
        (self.0.index()..self.1.index()).map(Inst::new)
    }
}

#[cfg(test)]
mod test {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn inst_range_bounds() {
        let range = InstRange::new(Inst::new(3), Inst::new(3));
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);

        let range = InstRange::new(Inst::new(2), Inst::new(6));
        assert_eq!(range.first(), Inst::new(2));
        assert_eq!(range.last(), Inst::new(5));
        assert_eq!(range.len(), 4);
        assert!(range.contains(Inst::new(5)));
        assert!(!range.contains(Inst::new(6)));
        assert_eq!(range.rest().first(), Inst::new(3));
    }

    #[test]
    fn inst_range_iter() {
        let range = InstRange::new(Inst::new(0), Inst::new(3));
        assert_eq!(
            range.iter().collect::<Vec<_>>(),
            vec![Inst::new(0), Inst::new(1), Inst::new(2)]
        );
        assert_eq!(
            range.iter().rev().collect::<Vec<_>>(),
            vec![Inst::new(2), Inst::new(1), Inst::new(0)]
        );
    }

    #[test]
    fn index_arena() {
        define_index!(Thing, Things, u64);
        let mut things = Things::default();
        let a = things.push(10);
        let b = things.push(20);
        assert_eq!(a, Thing::new(0));
        assert_eq!(b, Thing::new(1));
        things[b] += 1;
        assert_eq!(things[b], 21);
        assert_eq!(things.len(), 2);
        assert_eq!(things.iter().copied().collect::<Vec<_>>(), vec![10, 21]);
        assert!(!Thing::invalid().is_valid());
    }
}
