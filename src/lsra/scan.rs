/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The linear scan over the intervals of one trace.

use super::reg_traversal::RegTraversalIter;
use super::{floor_to_before, CodeRange, Env, IntervalIndex};
use crate::{
    Allocation, Function, OperandConstraint, PReg, ProgPoint, RegAllocError, TraceId, VReg,
};
use alloc::vec::Vec;
use bumpalo::Bump;
use smallvec::{smallvec, SmallVec};

type BumpVec<'b, T> = allocator_api2::vec::Vec<T, &'b Bump>;
type Candidates = SmallVec<[PReg; 16]>;
type Points = SmallVec<[ProgPoint; 16]>;

/// Intervals holding a register: `active` ones cover the current
/// position, `inactive` ones are in a lifetime hole there.
struct ScanLists<'b> {
    active: BumpVec<'b, IntervalIndex>,
    inactive: BumpVec<'b, IntervalIndex>,
}

fn reg_slot(cands: &[PReg], alloc: Allocation) -> Option<usize> {
    let reg = alloc.as_reg()?;
    cands.iter().position(|&r| r == reg)
}

impl<'a, F: Function> Env<'a, F> {
    pub fn allocate_trace(
        &mut self,
        trace: TraceId,
        roots: &[IntervalIndex],
    ) -> Result<(), RegAllocError> {
        trace!("allocating trace{}", trace.index());
        self.unhandled.clear();
        for &iv in roots {
            self.unhandled.push(iv, &self.intervals[iv]);
        }
        let mut bump = core::mem::take(&mut self.bump);
        let result = self.scan(&bump);
        bump.reset();
        self.bump = bump;
        result
    }

    fn scan(&mut self, bump: &Bump) -> Result<(), RegAllocError> {
        let mut lists = ScanLists {
            active: BumpVec::new_in(bump),
            inactive: BumpVec::new_in(bump),
        };
        while let Some(cur) = self.unhandled.pop() {
            let pos = self.intervals[cur].start();
            self.stats.process_interval_count += 1;
            self.advance(&mut lists, pos);
            trace!(
                "process interval{} ({}) at {:?}: {:?}",
                cur.index(),
                self.intervals[cur].vreg,
                pos,
                self.intervals[cur].ranges
            );
            self.process_interval(cur, pos, &mut lists)?;
        }
        Ok(())
    }

    /// Retire intervals that ended before `pos` and move the others
    /// between the active and inactive lists.
    fn advance(&self, lists: &mut ScanLists<'_>, pos: ProgPoint) {
        let mut i = 0;
        while i < lists.inactive.len() {
            let iv = &self.intervals[lists.inactive[i]];
            if iv.end() <= pos {
                lists.inactive.swap_remove(i);
            } else if iv.covers(pos) {
                let iv = lists.inactive.swap_remove(i);
                lists.active.push(iv);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < lists.active.len() {
            let iv = &self.intervals[lists.active[i]];
            if iv.end() <= pos {
                lists.active.swap_remove(i);
            } else if !iv.covers(pos) {
                let iv = lists.active.swap_remove(i);
                lists.inactive.push(iv);
            } else {
                i += 1;
            }
        }
    }

    fn process_interval(
        &mut self,
        cur: IntervalIndex,
        pos: ProgPoint,
        lists: &mut ScanLists<'_>,
    ) -> Result<(), RegAllocError> {
        let iv = &self.intervals[cur];

        // A value that must be on the stack first goes there right
        // away, until it next needs a register.
        if let Some(u) = iv.next_constrained_use(pos) {
            if u.operand.constraint() == OperandConstraint::Stack {
                let until = iv.next_reg_use(u.pos).map(|u| floor_to_before(u.pos));
                self.spill_until(cur, until);
                return Ok(());
            }
        }

        let cands: Candidates = RegTraversalIter::new(
            self.env,
            iv.vreg.class(),
            iv.first_fixed_reg(),
            iv.hint,
            iv.vreg.vreg(),
        )
        .collect();
        if cands.is_empty() {
            if iv.next_reg_use(pos).is_some() {
                return Err(RegAllocError::TooManyLiveRegs);
            }
            self.spill(cur);
            return Ok(());
        }
        let caps: Points = cands.iter().map(|&r| self.use_cap(cur, r, pos)).collect();

        let free_until = self.free_until(cur, pos, &cands, &caps, lists);
        let end = self.intervals[cur].end();

        if let Some(k) = (0..cands.len()).find(|&k| free_until[k] >= end) {
            trace!(" -> free register {}", cands[k]);
            self.intervals[cur].alloc = Allocation::reg(cands[k]);
            self.stats.assigned_free += 1;
            lists.active.push(cur);
            return Ok(());
        }

        let mut best = 0;
        for k in 1..cands.len() {
            if free_until[k] > free_until[best] {
                best = k;
            }
        }
        if free_until[best] > pos {
            let split_at = self.split_position(cur, pos, free_until[best]);
            trace!(" -> {} free until {:?}", cands[best], free_until[best]);
            let rest = self.split(cur, split_at);
            self.intervals[cur].alloc = Allocation::reg(cands[best]);
            self.stats.assigned_prefix += 1;
            lists.active.push(cur);
            if let Some(rest) = rest {
                self.requeue(rest);
            }
            return Ok(());
        }

        self.allocate_blocked(cur, pos, &cands, &caps, lists)
    }

    /// The point before which `cur` must leave `reg` because of its
    /// own later uses: a stack use, or a fixed use of another register.
    fn use_cap(&self, cur: IntervalIndex, reg: PReg, pos: ProgPoint) -> ProgPoint {
        let iv = &self.intervals[cur];
        let start = iv.uses.partition_point(|u| u.pos < pos);
        iv.uses[start..]
            .iter()
            .find(|u| match u.operand.constraint() {
                OperandConstraint::Stack => true,
                OperandConstraint::FixedReg(preg) => preg != reg,
                _ => false,
            })
            .map_or(ProgPoint::max(), |u| floor_to_before(u.pos))
    }

    /// The first reservation of `reg` not owned by `vreg` that `cur`
    /// runs into at or after `pos`.
    fn reservation_conflict(
        &self,
        cur: IntervalIndex,
        reg: PReg,
        vreg: VReg,
        pos: ProgPoint,
    ) -> Option<ProgPoint> {
        let iv = &self.intervals[cur];
        let reservations = &self.pregs[reg.index()].reservations;
        let start = reservations.partition_point(|r| r.range.to <= pos);
        let end = iv.end();
        reservations[start..]
            .iter()
            .take_while(|r| r.range.from < end)
            .filter(|r| r.owner != Some(vreg))
            .find_map(|r| iv.first_intersection_with_ranges(&[r.range], pos))
    }

    fn free_until(
        &self,
        cur: IntervalIndex,
        pos: ProgPoint,
        cands: &[PReg],
        caps: &[ProgPoint],
        lists: &ScanLists<'_>,
    ) -> Points {
        let iv = &self.intervals[cur];
        let mut free_until: Points = caps.iter().copied().collect();
        for &a in lists.active.iter() {
            if let Some(k) = reg_slot(cands, self.intervals[a].alloc) {
                free_until[k] = core::cmp::min(free_until[k], floor_to_before(pos));
            }
        }
        for &a in lists.inactive.iter() {
            let other = &self.intervals[a];
            if let Some(k) = reg_slot(cands, other.alloc) {
                if let Some(q) = iv.first_intersection(other, pos) {
                    free_until[k] = core::cmp::min(free_until[k], floor_to_before(q));
                }
            }
        }
        for (k, &reg) in cands.iter().enumerate() {
            if let Some(q) = self.reservation_conflict(cur, reg, iv.vreg, pos) {
                free_until[k] = core::cmp::min(free_until[k], floor_to_before(q));
            }
        }
        free_until
    }

    /// No register is free at `pos`. Either spill `cur` until its
    /// first register use, or take the register whose occupants are
    /// needed last and evict them.
    fn allocate_blocked(
        &mut self,
        cur: IntervalIndex,
        pos: ProgPoint,
        cands: &[PReg],
        caps: &[ProgPoint],
        lists: &mut ScanLists<'_>,
    ) -> Result<(), RegAllocError> {
        let iv = &self.intervals[cur];
        let mut next_use: Points = caps.iter().copied().collect();
        let mut block_pos: Points = caps.iter().copied().collect();
        let mut occupant_start: Points = smallvec![ProgPoint::max(); cands.len()];

        for &a in lists.active.iter() {
            let other = &self.intervals[a];
            if let Some(k) = reg_slot(cands, other.alloc) {
                // Uses earlier at this instruction count too: the
                // occupant would have to leave before them.
                let nu = if other.trivial {
                    floor_to_before(pos)
                } else {
                    other
                        .next_reg_use(floor_to_before(pos))
                        .map_or(ProgPoint::max(), |u| floor_to_before(u.pos))
                };
                next_use[k] = core::cmp::min(next_use[k], nu);
                occupant_start[k] = core::cmp::min(occupant_start[k], other.start());
            }
        }
        for &a in lists.inactive.iter() {
            let other = &self.intervals[a];
            if let Some(k) = reg_slot(cands, other.alloc) {
                if iv.first_intersection(other, pos).is_some() {
                    let nu = other
                        .next_reg_use(pos)
                        .map_or(ProgPoint::max(), |u| floor_to_before(u.pos));
                    next_use[k] = core::cmp::min(next_use[k], nu);
                    occupant_start[k] = core::cmp::min(occupant_start[k], other.start());
                }
            }
        }
        for (k, &reg) in cands.iter().enumerate() {
            if let Some(q) = self.reservation_conflict(cur, reg, iv.vreg, pos) {
                let q = floor_to_before(q);
                block_pos[k] = core::cmp::min(block_pos[k], q);
                next_use[k] = core::cmp::min(next_use[k], q);
            }
        }

        // Farthest next use wins; on a tie, the register whose occupant
        // started earliest, then traversal order.
        let mut k = 0;
        for j in 1..cands.len() {
            if next_use[j] > next_use[k]
                || (next_use[j] == next_use[k] && occupant_start[j] < occupant_start[k])
            {
                k = j;
            }
        }

        let first_reg_use = iv
            .next_reg_use(pos)
            .map_or(ProgPoint::max(), |u| floor_to_before(u.pos));
        if first_reg_use >= next_use[k] {
            if first_reg_use <= floor_to_before(pos) {
                trace!(" -> no register can be freed at {:?}", pos);
                return Err(RegAllocError::TooManyLiveRegs);
            }
            trace!(" -> spill until {:?}", first_reg_use);
            let until = if first_reg_use == ProgPoint::max() {
                None
            } else {
                Some(first_reg_use)
            };
            self.spill_until(cur, until);
            return Ok(());
        }

        let reg = cands[k];
        trace!(" -> evict {} (next use {:?})", reg, next_use[k]);
        self.intervals[cur].alloc = Allocation::reg(reg);
        self.stats.assigned_evict += 1;
        if block_pos[k] < self.intervals[cur].end() {
            let split_at = self.split_position(cur, pos, block_pos[k]);
            if let Some(rest) = self.split(cur, split_at) {
                self.requeue(rest);
            }
        }

        let mut victims: SmallVec<[IntervalIndex; 4]> = smallvec![];
        let holds = |env: &Self, a: IntervalIndex| env.intervals[a].alloc == Allocation::reg(reg);
        let mut i = 0;
        while i < lists.active.len() {
            if holds(self, lists.active[i]) {
                victims.push(lists.active.swap_remove(i));
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < lists.inactive.len() {
            let a = lists.inactive[i];
            if holds(self, a)
                && self.intervals[cur]
                    .first_intersection(&self.intervals[a], pos)
                    .is_some()
            {
                victims.push(lists.inactive.swap_remove(i));
            } else {
                i += 1;
            }
        }
        victims.sort_unstable();
        let split_at = floor_to_before(pos);
        for victim in victims {
            self.evict(victim, split_at);
        }
        lists.active.push(cur);
        Ok(())
    }

    /// Take the register away from `victim` from `at` on. The part
    /// after `at` lives on the stack until its next register use,
    /// where a reload child is queued.
    fn evict(&mut self, victim: IntervalIndex, at: ProgPoint) {
        debug_assert!(!self.intervals[victim].trivial);
        self.stats.evict_interval_count += 1;
        let child = if self.intervals[victim].start() >= at {
            self.intervals[victim].alloc = Allocation::none();
            victim
        } else {
            match self.split(victim, at) {
                Some(child) => child,
                None => return,
            }
        };
        trace!(
            " -> evicted interval{} from {:?} as interval{}",
            victim.index(),
            at,
            child.index()
        );

        let start = self.intervals[child].start();
        match self.intervals[child]
            .next_reg_use(start)
            .map(|u| floor_to_before(u.pos))
        {
            Some(nu) if nu > start => self.spill_until(child, Some(nu)),
            Some(_) => self.requeue(child),
            None => self.spill(child),
        }
    }

    /// Record the final register ranges and reservations of the trace
    /// whose intervals start at `first`.
    pub fn commit_trace(&mut self, first: IntervalIndex) {
        for i in first.index()..self.intervals.len() {
            let iv = &self.intervals[IntervalIndex::new(i)];
            if let Some(reg) = iv.alloc.as_reg() {
                let allocations = &mut self.pregs[reg.index()].allocations;
                for range in iv.ranges.iter() {
                    allocations.insert(range, iv.vreg);
                }
            }
        }
        for preg in self.pregs.iter_mut() {
            for r in preg.reservations.iter() {
                preg.reserved
                    .insert(&r.range, r.owner.unwrap_or_else(VReg::invalid));
            }
        }
    }

    /// Check that no two intervals of the trace share a register at
    /// one point, and that no interval sits on another owner's
    /// reservation.
    pub fn verify_trace(&self, first: IntervalIndex) {
        let mut by_reg: Vec<Vec<(CodeRange, VReg)>> = Vec::new();
        by_reg.resize(PReg::NUM_INDEX, Vec::new());
        for i in first.index()..self.intervals.len() {
            let iv = &self.intervals[IntervalIndex::new(i)];
            assert!(
                iv.alloc.is_reg() || iv.is_spilled(),
                "interval{} left unassigned",
                i
            );
            if let Some(reg) = iv.alloc.as_reg() {
                for range in iv.ranges.iter() {
                    by_reg[reg.index()].push((*range, iv.vreg));
                }
            }
        }
        for (reg, ranges) in by_reg.iter_mut().enumerate() {
            ranges.sort_unstable_by_key(|(r, _)| r.from);
            for pair in ranges.windows(2) {
                assert!(
                    pair[0].0.to <= pair[1].0.from,
                    "{} and {} overlap in {}",
                    pair[0].1,
                    pair[1].1,
                    PReg::from_index(reg)
                );
            }
            for res in self.pregs[reg].reservations.iter() {
                for (range, vreg) in ranges.iter() {
                    assert!(
                        res.owner == Some(*vreg) || !range.overlaps(&res.range),
                        "{} overlaps a reservation of {}",
                        vreg,
                        PReg::from_index(reg)
                    );
                }
            }
        }
    }
}
