/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use crate::{MachineEnv, PReg, RegClass};

/// The candidate registers for one interval, in the order they are
/// tried:
/// - the register of the interval's first fixed-register use, if any;
/// - the hint (usually where a predecessor trace left the value);
/// - the preferred registers, rotated by `offset` (the value number)
///   so that pressure spreads evenly;
/// - the non-preferred registers, rotated the same way.
///
/// The fixed register is offered even when it is not allocatable; the
/// others only when they are. No register is returned twice.
pub struct RegTraversalIter<'a> {
    pref_regs: &'a [PReg],
    non_pref_regs: &'a [PReg],
    firsts: [Option<PReg>; 2],
    first_idx: usize,
    pref_idx: usize,
    non_pref_idx: usize,
    offset: usize,
}

impl<'a> RegTraversalIter<'a> {
    pub fn new(
        env: &'a MachineEnv,
        class: RegClass,
        fixed: Option<PReg>,
        hint: PReg,
        offset: usize,
    ) -> Self {
        let hint = if hint.is_valid() && hint.class() == class && env.is_allocatable(hint) {
            Some(hint)
        } else {
            None
        };
        let firsts = match (fixed, hint) {
            (Some(f), Some(h)) if f == h => [Some(f), None],
            (None, h) => [h, None],
            (f, h) => [f, h],
        };
        Self {
            pref_regs: &env.preferred_regs_by_class[class.index()],
            non_pref_regs: &env.non_preferred_regs_by_class[class.index()],
            firsts,
            first_idx: 0,
            pref_idx: 0,
            non_pref_idx: 0,
            offset,
        }
    }

    fn is_first(&self, reg: PReg) -> bool {
        self.firsts.iter().any(|&r| r == Some(reg))
    }
}

impl<'a> Iterator for RegTraversalIter<'a> {
    type Item = PReg;

    fn next(&mut self) -> Option<PReg> {
        while self.first_idx < self.firsts.len() {
            let r = self.firsts[self.first_idx];
            self.first_idx += 1;
            if r.is_some() {
                return r;
            }
        }

        while self.pref_idx < self.pref_regs.len() {
            let n = self.pref_regs.len();
            let r = self.pref_regs[(self.pref_idx + self.offset) % n];
            self.pref_idx += 1;
            if !self.is_first(r) {
                return Some(r);
            }
        }

        while self.non_pref_idx < self.non_pref_regs.len() {
            let n = self.non_pref_regs.len();
            let r = self.non_pref_regs[(self.non_pref_idx + self.offset) % n];
            self.non_pref_idx += 1;
            if !self.is_first(r) {
                return Some(r);
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn env() -> MachineEnv {
        let r = |i| PReg::new(i, RegClass::Int);
        MachineEnv {
            preferred_regs_by_class: [vec![r(0), r(1), r(2)], vec![], vec![]],
            non_preferred_regs_by_class: [vec![r(3)], vec![], vec![]],
            scratch_by_class: [None, None, None],
        }
    }

    #[test]
    fn rotates_preferred_registers() {
        let env = env();
        let regs: Vec<usize> = RegTraversalIter::new(&env, RegClass::Int, None, PReg::invalid(), 1)
            .map(|r| r.hw_enc())
            .collect();
        assert_eq!(regs, vec![1, 2, 0, 3]);
    }

    #[test]
    fn fixed_then_hint_without_duplicates() {
        let env = env();
        let fixed = PReg::new(7, RegClass::Int);
        let hint = PReg::new(2, RegClass::Int);
        let regs: Vec<usize> = RegTraversalIter::new(&env, RegClass::Int, Some(fixed), hint, 0)
            .map(|r| r.hw_enc())
            .collect();
        assert_eq!(regs, vec![7, 2, 0, 1, 3]);
    }
}
