/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spillslot allocation.

use super::{CodeRange, Env, LiveRangeSet, SpillSlotData, SpillSlotIndex};
use crate::{Allocation, Function, RegClass, SpillSlot};
use smallvec::SmallVec;

/// How many existing slots of the right size to probe before opening
/// a new one.
const SLOT_PROBES: usize = 10;

impl<'a, F: Function> Env<'a, F> {
    /// Give every value with spilled ranges one slot for all of them.
    /// Values whose stack ranges never overlap share a slot.
    pub fn allocate_spillslots(&mut self) {
        for v in 0..self.vregs.len() {
            if self.vregs[v].spill_ranges.is_empty() {
                continue;
            }
            let ranges = normalize(&mut self.vregs[v].spill_ranges);
            let vreg = self.vregs[v].vreg;
            let size = self.func.spillslot_size(vreg.class());
            if size >= self.slots_by_size.len() {
                self.slots_by_size.resize(size + 1, SmallVec::new());
            }

            let fits = |slot: &SpillSlotData| ranges.iter().all(|r| !slot.ranges.overlaps(r));
            let found = self.slots_by_size[size]
                .iter()
                .rev()
                .take(SLOT_PROBES)
                .copied()
                .find(|&s| fits(&self.spillslots[s.index()]));
            let slot = match found {
                Some(slot) => slot,
                None => {
                    let slot = SpillSlotIndex::new(self.spillslots.len());
                    self.spillslots.push(SpillSlotData {
                        ranges: LiveRangeSet::default(),
                        size: size as u32,
                        alloc: Allocation::none(),
                    });
                    self.slots_by_size[size].push(slot);
                    self.stats.spill_slots += 1;
                    slot
                }
            };
            trace!("{} gets spillslot{} for {:?}", vreg, slot.index(), ranges);
            for r in ranges.iter() {
                self.spillslots[slot.index()].ranges.insert(r, vreg);
            }
            self.vregs[v].slot = slot;
        }

        for i in 0..self.spillslots.len() {
            self.spillslots[i].alloc = self.allocate_spillslot(self.spillslots[i].size);
        }

        for i in 0..self.intervals.len() {
            let iv = &mut self.intervals[super::IntervalIndex::new(i)];
            if iv.is_spilled() {
                let slot = self.vregs[iv.vreg.vreg()].slot;
                iv.alloc = self.spillslots[slot.index()].alloc;
            }
        }
        trace!("spillslot allocator done");
    }

    /// Reserve `size` consecutive frame slots, aligned to `size`.
    pub fn allocate_spillslot(&mut self, size: u32) -> Allocation {
        debug_assert!(size.is_power_of_two());
        let offset = (self.num_spillslots + size - 1) & !(size - 1);
        let slot = if self.func.multi_spillslot_named_by_last_slot() {
            offset + size - 1
        } else {
            offset
        };
        self.num_spillslots = offset + size;
        Allocation::stack(SpillSlot::new(slot as usize))
    }

    /// The `n`th spare slot of `class`, for move resolution. Spare
    /// slots are never shared with values.
    pub fn extra_spillslot(&mut self, class: RegClass, n: usize) -> Allocation {
        while self.extra_spillslots_by_class[class.index()].len() <= n {
            let size = self.func.spillslot_size(class) as u32;
            let slot = self.allocate_spillslot(size);
            self.extra_spillslots_by_class[class.index()].push(slot);
        }
        self.extra_spillslots_by_class[class.index()][n]
    }
}

/// Sort and merge overlapping or touching ranges in place.
fn normalize(ranges: &mut SmallVec<[CodeRange; 4]>) -> SmallVec<[CodeRange; 4]> {
    ranges.sort_unstable_by_key(|r| r.from);
    let mut out: SmallVec<[CodeRange; 4]> = SmallVec::new();
    for &r in ranges.iter() {
        match out.last_mut() {
            Some(last) if r.from <= last.to => last.to = core::cmp::max(last.to, r.to),
            _ => out.push(r),
        }
    }
    *ranges = out.clone();
    out
}
