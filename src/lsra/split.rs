/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Interval splitting.

use super::{floor_to_before, Env, Interval, IntervalIndex, RangeList, UseList};
use crate::{Function, ProgPoint};

impl<'a, F: Function> Env<'a, F> {
    /// Split `iv` at `pos`: `iv` keeps everything before `pos` and a
    /// new child takes the rest. `pos` must lie after the interval's
    /// start. Returns `None` if nothing of the interval is left at or
    /// after `pos`.
    pub fn split(&mut self, iv: IntervalIndex, pos: ProgPoint) -> Option<IntervalIndex> {
        let interval = &mut self.intervals[iv];
        debug_assert!(pos > interval.start());
        let idx = interval.ranges.partition_point(|r| r.to <= pos);
        if idx == interval.ranges.len() {
            return None;
        }

        let mut child_ranges: RangeList = interval.ranges[idx..].iter().copied().collect();
        if child_ranges[0].from < pos {
            child_ranges[0].from = pos;
            interval.ranges[idx].to = pos;
            interval.ranges.truncate(idx + 1);
        } else {
            interval.ranges.truncate(idx);
        }
        let u = interval.uses.partition_point(|u| u.pos < pos);
        let child_uses: UseList = interval.uses[u..].iter().copied().collect();
        interval.uses.truncate(u);

        let root = if interval.parent.is_valid() {
            interval.parent
        } else {
            iv
        };
        let hint = interval.alloc.as_reg().unwrap_or(interval.hint);
        let mut child = Interval::new(interval.vreg, interval.trace);
        child.ranges = child_ranges;
        child.uses = child_uses;
        child.parent = root;
        child.hint = hint;
        let child = self.intervals.push(child);

        let siblings = &mut self.intervals[root].children;
        let at = if iv == root {
            0
        } else {
            siblings.iter().position(|&c| c == iv).map_or(siblings.len(), |i| i + 1)
        };
        siblings.insert(at, child);

        self.stats.splits += 1;
        trace!(
            "split interval{} at {:?}: child interval{}",
            iv.index(),
            pos,
            child.index()
        );
        Some(child)
    }

    /// Choose where to split `iv` somewhere in `(min, max]`.
    ///
    /// The split goes to the start of a block of the interval's trace
    /// whose loop depth is lower than at `max`, taking the shallowest
    /// and then the latest such block; otherwise to `max` itself. The
    /// result is always an instruction's `Before` point.
    pub fn split_position(&mut self, iv: IntervalIndex, min: ProgPoint, max: ProgPoint) -> ProgPoint {
        let max = floor_to_before(max);
        debug_assert!(max > min);
        let depth = |p: ProgPoint| self.cfginfo.approx_loop_depth[self.cfginfo.block_of(p).index()];
        let max_depth = depth(max);

        let trace = self.intervals[iv].trace;
        let mut best: Option<(u32, ProgPoint)> = None;
        for &block in self.traces.trace(trace).blocks() {
            let start = self.cfginfo.block_entry[block.index()];
            if start <= min || start >= max {
                continue;
            }
            let d = self.cfginfo.approx_loop_depth[block.index()];
            if d >= max_depth {
                continue;
            }
            let better = match best {
                None => true,
                Some((bd, bp)) => d < bd || (d == bd && start > bp),
            };
            if better {
                best = Some((d, start));
            }
        }

        match best {
            Some((_, pos)) => {
                self.stats.splits_at_block_start += 1;
                pos
            }
            None => max,
        }
    }

    /// Mark `iv` as living in its value's spill slot.
    pub fn spill(&mut self, iv: IntervalIndex) {
        let interval = &mut self.intervals[iv];
        trace!("spill interval{} ({})", iv.index(), interval.vreg);
        debug_assert!(interval.uses.iter().all(|u| !u.requires_reg()));
        interval.spill_state = super::SpillState::Spilled;
        interval.alloc = crate::Allocation::none();
        let vreg = interval.vreg.vreg();
        let ranges: RangeList = interval.ranges.clone();
        self.vregs[vreg].spill_ranges.extend(ranges);
        self.stats.spilled_intervals += 1;
    }

    /// Spill `iv` up to (not including) `until`, and queue whatever
    /// follows for allocation. Without `until` the whole interval is
    /// spilled.
    pub fn spill_until(&mut self, iv: IntervalIndex, until: Option<ProgPoint>) {
        let start = self.intervals[iv].start();
        let rest = match until {
            Some(until) if floor_to_before(until) > start && until < self.intervals[iv].end() => {
                let pos = self.split_position(iv, start, until);
                self.split(iv, pos)
            }
            _ => None,
        };
        self.spill(iv);
        if let Some(rest) = rest {
            self.requeue(rest);
        }
    }

    pub fn requeue(&mut self, iv: IntervalIndex) {
        self.stats.requeued_intervals += 1;
        self.unhandled.push(iv, &self.intervals[iv]);
    }
}
