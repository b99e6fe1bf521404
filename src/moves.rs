/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Sequentializing parallel moves.

use crate::{Allocation, PReg};
use core::fmt::Debug;
use smallvec::{smallvec, SmallVec};

/// A list of moves to be performed in sequence, with auxiliary data
/// attached to each.
pub type MoveVec<T> = SmallVec<[(Allocation, Allocation, T); 16]>;

/// A sequential list of moves in which the scratch location, not
/// chosen yet, appears as `Allocation::none()`.
#[derive(Clone, Debug)]
pub struct ResolvedMoves<T> {
    pub moves: MoveVec<T>,
    /// Was a cycle broken through the scratch location?
    pub needs_scratch: bool,
}

impl<T> ResolvedMoves<T> {
    /// Fill in the scratch location. It must not occur anywhere in the
    /// parallel-move problem these moves were resolved from.
    pub fn with_scratch(self, scratch: Allocation) -> MoveVec<T> {
        let mut moves = self.moves;
        if self.needs_scratch {
            for (src, dst, _) in &mut moves {
                debug_assert!(*src != scratch && *dst != scratch);
                if src.is_none() {
                    *src = scratch;
                }
                if dst.is_none() {
                    *dst = scratch;
                }
            }
        }
        moves
    }
}

/// A `ParallelMoves` represents a list of alloc-to-alloc moves that
/// must happen in parallel: all reads of sources semantically happen
/// before all writes of destinations. Each destination has exactly one
/// writer.
pub struct ParallelMoves<T: Copy> {
    parallel_moves: MoveVec<T>,
}

impl<T: Copy> ParallelMoves<T> {
    pub fn new() -> Self {
        Self {
            parallel_moves: smallvec![],
        }
    }

    pub fn add(&mut self, from: Allocation, to: Allocation, t: T) {
        self.parallel_moves.push((from, to, t));
    }

    /// Resolve into a sequence of moves with the same combined effect.
    ///
    /// Works on a worklist: a move whose destination no pending move
    /// still reads is safe and is emitted at once. When nothing is
    /// safe, every pending move sits on a cycle. Since each location
    /// has one writer, cycles are simple rings: one source is parked
    /// in the scratch location, which frees the ring to unwind, and
    /// the move that read it now reads the scratch instead.
    ///
    /// Moves are emitted in the order they were added wherever the
    /// dependencies allow, so the output is deterministic.
    pub fn resolve(self) -> ResolvedMoves<T> {
        let mut pending: MoveVec<T> = self
            .parallel_moves
            .into_iter()
            .filter(|&(src, dst, _)| src != dst)
            .collect();
        debug_assert!(pending
            .iter()
            .enumerate()
            .all(|(i, m)| pending[i + 1..].iter().all(|n| n.1 != m.1)));

        let mut ret: MoveVec<T> = smallvec![];
        let mut needs_scratch = false;
        while !pending.is_empty() {
            let mut progress = false;
            let mut i = 0;
            while i < pending.len() {
                let dst = pending[i].1;
                if pending.iter().any(|&(src, _, _)| src == dst) {
                    i += 1;
                } else {
                    ret.push(pending.remove(i));
                    progress = true;
                    i = 0;
                }
            }
            if progress {
                continue;
            }

            // Stuck: park the first move's source in the scratch
            // location. Its writer becomes safe on the next pass.
            let (src, _, t) = pending[0];
            debug_assert!(src.is_some());
            trace!("parallel moves: breaking cycle at {}", src);
            ret.push((src, Allocation::none(), t));
            pending[0].0 = Allocation::none();
            needs_scratch = true;
        }

        ResolvedMoves {
            moves: ret,
            needs_scratch,
        }
    }
}

/// Final stage of move resolution: choosing the scratch location and
/// making sure no stack-to-stack move remains unless the target allows
/// them.
///
/// The cycle scratch is, in order of preference, the dedicated scratch
/// register of the class, a register free at the move site, or a spare
/// spill slot. A stack-to-stack move is then split into two moves
/// through a register: a (second) free register if there is one,
/// otherwise a victim register whose value is saved to a second spare
/// slot around the move.
pub struct ScratchResolver<'a, GetStackSlot>
where
    GetStackSlot: FnMut(usize) -> Allocation,
{
    /// Registers free at the move site, in preference order.
    free_regs: &'a [PReg],
    dedicated: Option<PReg>,
    /// Last resort for stack-to-stack moves.
    victim: Option<PReg>,
    stack_to_stack_ok: bool,
    /// Returns the `n`th spare slot of the class.
    get_stackslot: GetStackSlot,
}

impl<'a, GetStackSlot> ScratchResolver<'a, GetStackSlot>
where
    GetStackSlot: FnMut(usize) -> Allocation,
{
    pub fn new(
        free_regs: &'a [PReg],
        dedicated: Option<PReg>,
        victim: Option<PReg>,
        stack_to_stack_ok: bool,
        get_stackslot: GetStackSlot,
    ) -> Self {
        Self {
            free_regs,
            dedicated,
            victim,
            stack_to_stack_ok,
            get_stackslot,
        }
    }

    /// Returns `None` if a stack-to-stack move is needed and the class
    /// has no register to route it through.
    pub fn compute<T: Debug + Copy>(mut self, resolved: ResolvedMoves<T>) -> Option<MoveVec<T>> {
        let mut regs = self.dedicated.into_iter().chain(self.free_regs.iter().copied());

        let moves = if resolved.needs_scratch {
            let scratch = match regs.next() {
                Some(reg) => Allocation::reg(reg),
                None => (self.get_stackslot)(0),
            };
            trace!("scratch resolver: cycle scratch {}", scratch);
            resolved.with_scratch(scratch)
        } else {
            resolved.moves
        };

        let is_stack_to_stack = |&(src, dst, _): &(Allocation, Allocation, T)| {
            src.is_stack() && dst.is_stack()
        };
        if self.stack_to_stack_ok || !moves.iter().any(is_stack_to_stack) {
            return Some(moves);
        }

        let (tmp, save) = match regs.next() {
            Some(reg) => (Allocation::reg(reg), None),
            None => {
                let victim = Allocation::reg(self.victim?);
                let save = (self.get_stackslot)(1);
                trace!("scratch resolver: victim {} saved to {}", victim, save);
                (victim, Some(save))
            }
        };

        let mut result: MoveVec<T> = smallvec![];
        for &(src, dst, t) in &moves {
            if !(src.is_stack() && dst.is_stack()) {
                result.push((src, dst, t));
                continue;
            }
            match save {
                None => {
                    result.push((src, tmp, t));
                    result.push((tmp, dst, t));
                }
                Some(save) => {
                    result.push((tmp, save, t));
                    result.push((src, tmp, t));
                    result.push((tmp, dst, t));
                    result.push((save, tmp, t));
                }
            }
        }
        trace!("scratch resolver: got {:?}", result);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RegClass, SpillSlot};
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    fn r(n: usize) -> Allocation {
        Allocation::reg(PReg::new(n, RegClass::Int))
    }

    fn s(n: usize) -> Allocation {
        Allocation::stack(SpillSlot::new(n))
    }

    /// Execute `moves` on a machine where every location starts out
    /// holding its own name.
    fn simulate(moves: &[(Allocation, Allocation, ())]) -> BTreeMap<u32, u32> {
        let mut state: BTreeMap<u32, u32> = BTreeMap::new();
        for &(src, dst, _) in moves {
            let value = state.get(&src.bits()).copied().unwrap_or(src.bits());
            state.insert(dst.bits(), value);
        }
        state
    }

    fn check_parallel(parallel: &[(Allocation, Allocation)], seq: &[(Allocation, Allocation, ())]) {
        let state = simulate(seq);
        for &(src, dst) in parallel {
            assert_eq!(state.get(&dst.bits()).copied(), Some(src.bits()), "{} <- {}", dst, src);
        }
    }

    fn resolve(parallel: &[(Allocation, Allocation)]) -> ResolvedMoves<()> {
        let mut pm = ParallelMoves::new();
        for &(src, dst) in parallel {
            pm.add(src, dst, ());
        }
        pm.resolve()
    }

    #[test]
    fn chain_needs_no_scratch() {
        let parallel = [(r(0), r(1)), (r(1), r(2)), (r(2), r(3))];
        let resolved = resolve(&parallel);
        assert!(!resolved.needs_scratch);
        assert_eq!(
            resolved.moves.iter().map(|m| (m.0, m.1)).collect::<Vec<_>>(),
            [(r(2), r(3)), (r(1), r(2)), (r(0), r(1))]
        );
        check_parallel(&parallel, &resolved.moves);
    }

    #[test]
    fn self_moves_are_dropped() {
        let resolved = resolve(&[(r(0), r(0)), (s(1), s(1))]);
        assert!(resolved.moves.is_empty());
        assert!(!resolved.needs_scratch);
    }

    #[test]
    fn swap_uses_scratch() {
        let parallel = [(r(0), r(1)), (r(1), r(0))];
        let resolved = resolve(&parallel);
        assert!(resolved.needs_scratch);
        assert_eq!(resolved.moves.len(), 3);
        let moves = resolved.with_scratch(r(7));
        check_parallel(&parallel, &moves);
    }

    #[test]
    fn two_cycles_and_a_fanout() {
        let parallel = [
            (r(0), r(1)),
            (r(1), r(2)),
            (r(2), r(0)),
            (r(3), r(4)),
            (r(4), r(3)),
            (r(0), s(0)),
            (r(0), s(1)),
        ];
        let resolved = resolve(&parallel);
        assert!(resolved.needs_scratch);
        let moves = resolved.with_scratch(s(9));
        check_parallel(&parallel, &moves);
    }

    #[test]
    fn stack_to_stack_through_free_reg() {
        let parallel = [(s(0), s(1)), (r(0), r(1))];
        let free = [PReg::new(5, RegClass::Int)];
        let resolver = ScratchResolver::new(&free, None, None, false, |_| unreachable!());
        let moves = resolver.compute(resolve(&parallel)).unwrap();
        assert!(moves.iter().all(|m| !(m.0.is_stack() && m.1.is_stack())));
        assert!(moves.contains(&(s(0), r(5), ())));
        check_parallel(&parallel, &moves);
    }

    #[test]
    fn stack_cycle_with_victim() {
        // A swap of two slots with no free register: the cycle goes
        // through spare slot 0, and every stack-to-stack move borrows
        // the victim, saved in spare slot 1.
        let parallel = [(s(0), s(1)), (s(1), s(0))];
        let victim = PReg::new(0, RegClass::Int);
        let resolver = ScratchResolver::new(&[], None, Some(victim), false, |n| s(100 + n));
        let moves = resolver.compute(resolve(&parallel)).unwrap();
        assert!(moves.iter().all(|m| !(m.0.is_stack() && m.1.is_stack())));
        check_parallel(&parallel, &moves);
        let state = simulate(&moves);
        assert_eq!(state.get(&r(0).bits()).copied(), Some(r(0).bits()));
    }

    #[test]
    fn stack_to_stack_allowed() {
        let parallel = [(s(0), s(1)), (s(1), s(0))];
        let free = [PReg::new(3, RegClass::Int)];
        let resolver = ScratchResolver::new(&free, None, None, true, |_| unreachable!());
        let moves = resolver.compute(resolve(&parallel)).unwrap();
        assert_eq!(moves.len(), 3);
        assert!(moves.iter().any(|m| m.1 == r(3)));
        check_parallel(&parallel, &moves);
    }

    #[test]
    fn no_register_for_stack_to_stack() {
        let parallel = [(s(0), s(1))];
        let resolver = ScratchResolver::new(&[], None, None, false, |n| s(100 + n));
        assert!(resolver.compute(resolve(&parallel)).is_none());
    }

    #[test]
    fn dedicated_scratch_comes_first() {
        let parallel = [(r(0), r(1)), (r(1), r(0))];
        let free = [PReg::new(3, RegClass::Int)];
        let dedicated = PReg::new(9, RegClass::Int);
        let resolver =
            ScratchResolver::new(&free, Some(dedicated), None, false, |_| unreachable!());
        let moves = resolver.compute(resolve(&parallel)).unwrap();
        assert!(moves.iter().any(|m| m.1 == r(9)));
        check_parallel(&parallel, &moves);
    }
}
