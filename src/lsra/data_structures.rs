/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Data structures for the trace linear-scan allocator.

use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};

use bumpalo::Bump;
use smallvec::SmallVec;

use crate::cfg::CFGInfo;
use crate::indexset::IndexSet;
use crate::trace::TraceBuilderResult;
use crate::{
    Allocation, Edit, EdgeResolution, Function, MachineEnv, Operand,
    OperandConstraint, PReg, ProgPoint, TraceId, VReg,
};

/// A range from `from` (inclusive) to `to` (exclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeRange {
    pub from: ProgPoint,
    pub to: ProgPoint,
}

impl CodeRange {
    #[inline(always)]
    pub fn new(from: ProgPoint, to: ProgPoint) -> Self {
        debug_assert!(from <= to);
        Self { from, to }
    }
    #[inline(always)]
    pub fn overlaps(&self, other: &Self) -> bool {
        other.to > self.from && other.from < self.to
    }
    /// First point shared with `other`, if any.
    #[inline(always)]
    pub fn intersection_start(&self, other: &Self) -> Option<ProgPoint> {
        if self.overlaps(other) {
            Some(core::cmp::max(self.from, other.from))
        } else {
            None
        }
    }
}

/// Round a point down to the move-insertion point of its instruction.
#[inline(always)]
pub fn floor_to_before(point: ProgPoint) -> ProgPoint {
    ProgPoint::before(point.inst())
}

define_index!(IntervalIndex, Intervals, Interval);
define_index!(SpillSlotIndex);

pub type RangeList = SmallVec<[CodeRange; 4]>;
pub type UseList = SmallVec<[UsePos; 4]>;

/// A mention of the interval's value by an operand.
#[derive(Clone, Copy, Debug)]
pub struct UsePos {
    pub pos: ProgPoint,
    pub operand: Operand,
    /// Index of the operand within its instruction.
    pub slot: u16,
}

impl UsePos {
    #[inline(always)]
    pub fn requires_reg(&self) -> bool {
        matches!(
            self.operand.constraint(),
            OperandConstraint::Reg | OperandConstraint::FixedReg(_)
        )
    }

    #[inline(always)]
    pub fn is_constrained(&self) -> bool {
        self.operand.constraint() != OperandConstraint::Any
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillState {
    /// In a register, or not processed yet.
    NoSpill,
    /// In the spill slot of its value.
    Spilled,
}

/// The live range of one value within one trace, or a split child of
/// one.
#[derive(Clone, Debug)]
pub struct Interval {
    pub vreg: VReg,
    pub trace: TraceId,
    /// Sorted, disjoint and non-adjacent.
    pub ranges: RangeList,
    /// Sorted by position.
    pub uses: UseList,
    pub alloc: Allocation,
    pub spill_state: SpillState,
    /// The root of the split family, or `invalid()` on the root.
    pub parent: IntervalIndex,
    /// Split children in position order. Only kept on the root.
    pub children: SmallVec<[IntervalIndex; 2]>,
    pub hint: PReg,
    /// Consists of a dead definition only.
    pub trivial: bool,
}

impl Interval {
    pub fn new(vreg: VReg, trace: TraceId) -> Self {
        Self {
            vreg,
            trace,
            ranges: SmallVec::new(),
            uses: SmallVec::new(),
            alloc: Allocation::none(),
            spill_state: SpillState::NoSpill,
            parent: IntervalIndex::invalid(),
            children: SmallVec::new(),
            hint: PReg::invalid(),
            trivial: false,
        }
    }

    #[inline(always)]
    pub fn start(&self) -> ProgPoint {
        self.ranges[0].from
    }

    #[inline(always)]
    pub fn end(&self) -> ProgPoint {
        self.ranges[self.ranges.len() - 1].to
    }

    #[inline(always)]
    pub fn is_spilled(&self) -> bool {
        self.spill_state == SpillState::Spilled
    }

    pub fn covers(&self, point: ProgPoint) -> bool {
        self.range_index_at(point).is_ok()
    }

    /// `Ok(i)` if range `i` contains `point`, else `Err(i)` with the
    /// index of the first range after it.
    pub fn range_index_at(&self, point: ProgPoint) -> Result<usize, usize> {
        self.ranges.binary_search_by(|r| {
            if r.to <= point {
                Ordering::Less
            } else if r.from > point {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
    }

    /// First point at or after `from` where both intervals are live.
    pub fn first_intersection(&self, other: &Interval, from: ProgPoint) -> Option<ProgPoint> {
        self.first_intersection_with_ranges(&other.ranges, from)
    }

    pub fn first_intersection_with_ranges(
        &self,
        other: &[CodeRange],
        from: ProgPoint,
    ) -> Option<ProgPoint> {
        let mut i = match self.range_index_at(from) {
            Ok(i) | Err(i) => i,
        };
        let mut j = other.partition_point(|r| r.to <= from);
        while i < self.ranges.len() && j < other.len() {
            let a = self.ranges[i];
            let b = other[j];
            if let Some(p) = a.intersection_start(&b) {
                return Some(core::cmp::max(p, from));
            }
            if a.to <= b.from {
                i += 1;
            } else {
                j += 1;
            }
        }
        None
    }

    /// The first use at or after `from` that needs a register.
    pub fn next_reg_use(&self, from: ProgPoint) -> Option<&UsePos> {
        let start = self.uses.partition_point(|u| u.pos < from);
        self.uses[start..].iter().find(|u| u.requires_reg())
    }

    /// The first use at or after `from` with any constraint.
    pub fn next_constrained_use(&self, from: ProgPoint) -> Option<&UsePos> {
        let start = self.uses.partition_point(|u| u.pos < from);
        self.uses[start..].iter().find(|u| u.is_constrained())
    }

    pub fn first_fixed_reg(&self) -> Option<PReg> {
        self.uses.iter().find_map(|u| u.operand.as_fixed_reg())
    }

    /// Adds `range` in front of every existing range. Used while
    /// building intervals backwards; merges touching ranges.
    pub fn prepend_range(&mut self, range: CodeRange) {
        match self.ranges.first_mut() {
            Some(first) if range.to >= first.from => {
                first.from = core::cmp::min(first.from, range.from);
            }
            _ => self.ranges.insert(0, range),
        }
    }
}

/// Per-vreg bookkeeping across all traces.
#[derive(Clone, Debug)]
pub struct VRegData {
    pub vreg: VReg,
    /// Root interval per trace that mentions this value, in trace order.
    pub roots: SmallVec<[IntervalIndex; 2]>,
    /// Stack ranges of all spilled children, plus the points where
    /// moves touch the slot.
    pub spill_ranges: SmallVec<[CodeRange; 4]>,
    pub slot: SpillSlotIndex,
}

/// A stretch of a physical register that only one owner may use:
/// a fixed-register operand, or (without owner) a clobber.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    pub range: CodeRange,
    pub owner: Option<VReg>,
}

#[derive(Clone, Debug, Default)]
pub struct PRegData {
    /// Reservations of the trace being allocated, sorted by start.
    pub reservations: Vec<Reservation>,
    /// Intervals assigned to this register, across all traces. Used to
    /// look for free scratch registers.
    pub allocations: LiveRangeSet,
    /// Reservations of every trace allocated so far.
    pub reserved: LiveRangeSet,
}

#[derive(Clone, Debug)]
pub struct SpillSlotData {
    pub ranges: LiveRangeSet,
    pub size: u32,
    pub alloc: Allocation,
}

#[derive(Clone, Debug, Default)]
pub struct LiveRangeSet {
    pub btree: BTreeMap<LiveRangeKey, VReg>,
}

impl LiveRangeSet {
    pub fn overlaps(&self, range: &CodeRange) -> bool {
        self.btree.contains_key(&LiveRangeKey::from_range(range))
    }

    /// Adds a range that overlaps nothing already in the set.
    pub fn insert(&mut self, range: &CodeRange, vreg: VReg) {
        debug_assert!(!self.overlaps(range));
        self.btree.insert(LiveRangeKey::from_range(range), vreg);
    }
}

/// A key that compares equal to any key it overlaps, so that a
/// `BTreeMap` of disjoint ranges answers overlap queries.
#[derive(Clone, Copy, Debug)]
pub struct LiveRangeKey {
    pub from: u32,
    pub to: u32,
}

impl LiveRangeKey {
    #[inline(always)]
    pub fn from_range(range: &CodeRange) -> Self {
        Self {
            from: range.from.to_index(),
            to: range.to.to_index(),
        }
    }
}

impl PartialEq for LiveRangeKey {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.to > other.from && self.from < other.to
    }
}
impl Eq for LiveRangeKey {}
impl PartialOrd for LiveRangeKey {
    #[inline(always)]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for LiveRangeKey {
    #[inline(always)]
    fn cmp(&self, other: &Self) -> Ordering {
        if self.to <= other.from {
            Ordering::Less
        } else if self.from >= other.to {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Processing order of unhandled intervals: start ascending, then
/// longer intervals first, then value number and arena index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnhandledKey {
    pub start: ProgPoint,
    pub end: Reverse<ProgPoint>,
    pub vreg: u32,
    pub interval: IntervalIndex,
}

#[derive(Clone, Debug, Default)]
pub struct UnhandledQueue {
    pub heap: BinaryHeap<Reverse<UnhandledKey>>,
}

impl UnhandledQueue {
    pub fn push(&mut self, interval: IntervalIndex, iv: &Interval) {
        self.heap.push(Reverse(UnhandledKey {
            start: iv.start(),
            end: Reverse(iv.end()),
            vreg: iv.vreg.vreg() as u32,
            interval,
        }));
    }

    pub fn pop(&mut self) -> Option<IntervalIndex> {
        self.heap.pop().map(|Reverse(key)| key.interval)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Where a pending move writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveDest {
    Interval(IntervalIndex),
    Reg(PReg),
}

/// A move recorded before spill slots are known.
#[derive(Clone, Copy, Debug)]
pub struct PendingMove {
    pub pos: ProgPoint,
    pub prio: InsertMovePrio,
    pub from: IntervalIndex,
    pub to: MoveDest,
    pub vreg: VReg,
    /// Index into `Env::edges` for edge moves.
    pub edge: Option<u32>,
}

/// A copy of a value into a second fixed register at one instruction.
#[derive(Clone, Copy, Debug)]
pub struct MultiFixedRegFixup {
    pub pos: ProgPoint,
    pub vreg: VReg,
    pub preg: PReg,
    /// Index into `Env::allocs` of the operand that reads the copy.
    pub alloc_index: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct InsertedMove {
    pub pos: ProgPoint,
    pub prio: InsertMovePrio,
    pub from_alloc: Allocation,
    pub to_alloc: Allocation,
    pub to_vreg: VReg,
}

/// Order of move groups at one program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InsertMovePrio {
    InEdgeMoves,
    Split,
    MultiFixedReg,
    OutEdgeMoves,
}

/// Counters describing one allocation run.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    pub livein_iterations: usize,
    pub traces: usize,
    pub initial_interval_count: usize,
    pub final_interval_count: usize,
    pub reservations: usize,
    pub multi_fixed_fixups: usize,
    pub process_interval_count: usize,
    pub assigned_free: usize,
    pub assigned_prefix: usize,
    pub assigned_evict: usize,
    pub evict_interval_count: usize,
    pub spilled_intervals: usize,
    pub requeued_intervals: usize,
    pub splits: usize,
    pub splits_at_block_start: usize,
    pub spill_slots: usize,
    pub edges: usize,
    pub edges_with_moves: usize,
    pub edge_moves: usize,
    pub split_moves: usize,
    pub scratch_cycles: usize,
    pub stack_to_stack_moves: usize,
    pub edits_count: usize,
}

pub struct Env<'a, F: Function> {
    pub func: &'a F,
    pub env: &'a MachineEnv,
    pub traces: &'a TraceBuilderResult,
    pub stack_to_stack_ok: [bool; 3],
    pub cfginfo: CFGInfo,
    pub liveins: Vec<IndexSet>,
    pub liveouts: Vec<IndexSet>,

    pub vregs: Vec<VRegData>,
    pub intervals: Intervals,
    pub pregs: Vec<PRegData>,
    pub unhandled: UnhandledQueue,
    /// Per-trace scratch memory for the active and inactive lists.
    pub bump: Bump,

    pub spillslots: Vec<SpillSlotData>,
    pub slots_by_size: Vec<SmallVec<[SpillSlotIndex; 4]>>,
    pub extra_spillslots_by_class: [SmallVec<[Allocation; 2]>; 3],
    pub num_spillslots: u32,

    pub multi_fixed_reg_fixups: Vec<MultiFixedRegFixup>,
    pub pending_moves: Vec<PendingMove>,
    pub edges: Vec<EdgeResolution>,

    // Output:
    pub edits: Vec<(ProgPoint, Edit)>,
    pub allocs: Vec<Allocation>,
    pub inst_alloc_offsets: Vec<u32>,
    pub stats: Stats,
}
