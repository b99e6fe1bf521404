/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A trace-based linear-scan register allocator.
//!
//! The input function is partitioned into *traces*: single-entry
//! sequences of basic blocks. Each trace is allocated on its own with
//! a linear scan over its live intervals, in the order given by the
//! trace builder. Afterwards every control-flow edge is reconciled:
//! wherever a value sits in different places on the two sides of an
//! edge, a move is scheduled on that edge.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

use alloc::vec::Vec;
use core::hash::BuildHasherDefault;
use rustc_hash::FxHasher;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, BuildHasherDefault<FxHasher>>;

#[macro_use]
mod index;
pub use index::{Block, Inst, InstRange, TraceId};

pub(crate) mod cfg;
pub(crate) mod indexset;
pub(crate) mod lsra;
pub(crate) mod moves;

mod context;
pub use context::{AllocationContext, EditMoveFactory, MoveFactory};

pub mod checker;
pub mod trace;

pub use lsra::Stats;

#[cfg(feature = "enable-serde")]
pub mod serialize;

#[cfg(any(test, feature = "fuzzing"))]
pub mod fuzzing;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Register classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegClass {
    Int = 0,
    Float = 1,
    Vector = 2,
}

impl RegClass {
    pub const ALL: [RegClass; 3] = [RegClass::Int, RegClass::Float, RegClass::Vector];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as u8 as usize
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => RegClass::Int,
            1 => RegClass::Float,
            2 => RegClass::Vector,
            _ => panic!("invalid register class index {}", index),
        }
    }
}

/// A physical register. Contains a physical register number and a class.
///
/// The `hw_enc` field contains the physical register number and is in
/// a logically separate index space per class; in other words, Int
/// register 0 is different than Float register 0.
///
/// `hw_enc` must fit in 6 bits, i.e., at most 64 registers per class.
/// The value returned by `index()` lives in a single index space
/// shared by all classes, with the class in the bits above `hw_enc`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PReg {
    bits: u8,
}

impl PReg {
    pub const MAX_BITS: usize = 6;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;
    pub const NUM_INDEX: usize = 3 << Self::MAX_BITS;

    /// Create a new PReg. The `hw_enc` range is 6 bits.
    #[inline(always)]
    pub const fn new(hw_enc: usize, class: RegClass) -> Self {
        assert!(hw_enc <= PReg::MAX);
        PReg {
            bits: ((class as u8) << Self::MAX_BITS) | (hw_enc as u8),
        }
    }

    /// The physical register number, as encoded by the ISA for the
    /// particular register class.
    #[inline(always)]
    pub fn hw_enc(self) -> usize {
        self.bits as usize & Self::MAX
    }

    /// The register class.
    #[inline(always)]
    pub fn class(self) -> RegClass {
        RegClass::from_index((self.bits >> Self::MAX_BITS) as usize)
    }

    /// Get an index into the (not necessarily contiguous) index space of
    /// all physical registers. Allows one to maintain an array of data for
    /// all PRegs and index it efficiently.
    #[inline(always)]
    pub fn index(self) -> usize {
        self.bits as usize
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < Self::NUM_INDEX);
        PReg { bits: index as u8 }
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        PReg::new(Self::MAX, RegClass::Int)
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self != Self::invalid()
    }
}

impl core::fmt::Debug for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "PReg(hw = {}, class = {:?}, index = {})",
            self.hw_enc(),
            self.class(),
            self.index()
        )
    }
}

impl core::fmt::Display for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let class = match self.class() {
            RegClass::Int => "i",
            RegClass::Float => "f",
            RegClass::Vector => "v",
        };
        write!(f, "p{}{}", self.hw_enc(), class)
    }
}

/// A set of physical registers, one bit per `PReg::index()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PRegSet {
    bits: [u64; 3],
}

impl PRegSet {
    pub const fn empty() -> Self {
        Self { bits: [0; 3] }
    }

    #[inline(always)]
    fn split_index(reg: PReg) -> (usize, u64) {
        let index = reg.index();
        (index >> 6, 1u64 << (index & 63))
    }

    pub fn contains(&self, reg: PReg) -> bool {
        let (word, bit) = Self::split_index(reg);
        self.bits[word] & bit != 0
    }

    /// Returns a copy of this set with `reg` added.
    pub fn with(mut self, reg: PReg) -> Self {
        self.add(reg);
        self
    }

    pub fn add(&mut self, reg: PReg) {
        let (word, bit) = Self::split_index(reg);
        self.bits[word] |= bit;
    }

    pub fn remove(&mut self, reg: PReg) {
        let (word, bit) = Self::split_index(reg);
        self.bits[word] &= !bit;
    }

    pub fn union_from(&mut self, other: PRegSet) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl IntoIterator for PRegSet {
    type Item = PReg;
    type IntoIter = PRegSetIter;

    fn into_iter(self) -> PRegSetIter {
        PRegSetIter {
            bits: self.bits,
            word: 0,
        }
    }
}

impl core::iter::FromIterator<PReg> for PRegSet {
    fn from_iter<I: IntoIterator<Item = PReg>>(iter: I) -> Self {
        let mut set = PRegSet::empty();
        for reg in iter {
            set.add(reg);
        }
        set
    }
}

/// Iterator over a `PRegSet`, in increasing index order.
pub struct PRegSetIter {
    bits: [u64; 3],
    word: usize,
}

impl Iterator for PRegSetIter {
    type Item = PReg;

    fn next(&mut self) -> Option<PReg> {
        while self.word < self.bits.len() {
            let w = self.bits[self.word];
            if w != 0 {
                let bit = w.trailing_zeros() as usize;
                self.bits[self.word] &= w - 1;
                return Some(PReg::from_index((self.word << 6) | bit));
            }
            self.word += 1;
        }
        None
    }
}

/// A virtual register. Contains a virtual register number and a class.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VReg {
    bits: u32,
}

impl VReg {
    pub const MAX_BITS: usize = 19;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;

    #[inline(always)]
    pub const fn new(virt_reg: usize, class: RegClass) -> Self {
        assert!(virt_reg <= VReg::MAX);
        VReg {
            bits: ((virt_reg as u32) << 2) | (class as u8 as u32),
        }
    }

    #[inline(always)]
    pub fn vreg(self) -> usize {
        (self.bits >> 2) as usize
    }

    #[inline(always)]
    pub fn class(self) -> RegClass {
        RegClass::from_index((self.bits & 3) as usize)
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        VReg::new(Self::MAX, RegClass::Int)
    }

    #[inline(always)]
    pub fn bits(self) -> usize {
        self.bits as usize
    }
}

impl core::fmt::Debug for VReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "VReg(vreg = {}, class = {:?})",
            self.vreg(),
            self.class()
        )
    }
}

impl core::fmt::Display for VReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "v{}", self.vreg())
    }
}

/// A spillslot is a memory location that can hold a value of any
/// class. Slot numbers are assigned by the allocator; the client maps
/// them onto its frame layout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SpillSlot {
    bits: u32,
}

impl SpillSlot {
    pub const MAX: usize = (1 << 24) - 1;

    #[inline(always)]
    pub fn new(slot: usize) -> Self {
        debug_assert!(slot <= Self::MAX);
        SpillSlot { bits: slot as u32 }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.bits as usize
    }

    /// Get the spillslot `offset` slots away.
    #[inline(always)]
    pub fn plus(self, offset: usize) -> Self {
        SpillSlot::new(self.index() + offset)
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        SpillSlot { bits: 0xffff_ffff }
    }

    #[inline(always)]
    pub fn is_invalid(self) -> bool {
        self == Self::invalid()
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self != Self::invalid()
    }
}

impl core::fmt::Debug for SpillSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "SpillSlot({})", self.bits)
    }
}

impl core::fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "stack{}", self.index())
    }
}

/// An `OperandConstraint` specifies where a vreg's value must be
/// placed at a particular reference to that vreg via an
/// `Operand`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum OperandConstraint {
    /// Any location is fine (register or stack slot).
    Any,
    /// Operand must be in a register. Register is read-only for Uses.
    Reg,
    /// Operand must be on the stack.
    Stack,
    /// Operand must be in a fixed register.
    FixedReg(PReg),
}

impl core::fmt::Display for OperandConstraint {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Reg => write!(f, "reg"),
            Self::Stack => write!(f, "stack"),
            Self::FixedReg(preg) => write!(f, "fixed({})", preg),
        }
    }
}

/// The role an operand plays in its instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum OperandKind {
    /// Writes the vreg. Each vreg has exactly one definition.
    Def = 0,
    /// Reads the vreg.
    Use = 1,
    /// Scratch location needed for the duration of the instruction;
    /// the vreg is defined and dies at this instruction.
    Temp = 2,
}

/// The point relative to its instruction at which an operand is read
/// or written.
///
/// `Early` uses read before the instruction, `Late` uses stay live
/// until the instruction finishes (so they cannot share a register
/// with a `Late` def). `Late` defs are written when the instruction
/// finishes and `Early` defs as it starts, which keeps them apart
/// from every input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum OperandPos {
    Early = 0,
    Late = 1,
}

/// An `Operand` encodes everything about a mention of a register in
/// an instruction: virtual register number, and any constraint that
/// applies to the register at this program point.
///
/// Bit layout (from the least significant bit): vreg number (19),
/// fixed preg encoding (6), class (2), pos (1), kind (2), constraint
/// tag (2).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Operand {
    bits: u32,
}

impl Operand {
    const PREG_SHIFT: u32 = 19;
    const CLASS_SHIFT: u32 = 25;
    const POS_SHIFT: u32 = 27;
    const KIND_SHIFT: u32 = 28;
    const CONSTRAINT_SHIFT: u32 = 30;

    #[inline(always)]
    pub fn new(
        vreg: VReg,
        constraint: OperandConstraint,
        kind: OperandKind,
        pos: OperandPos,
    ) -> Self {
        let (tag, preg_field) = match constraint {
            OperandConstraint::Any => (0u32, 0u32),
            OperandConstraint::Reg => (1, 0),
            OperandConstraint::Stack => (2, 0),
            OperandConstraint::FixedReg(preg) => {
                debug_assert_eq!(preg.class(), vreg.class());
                (3, preg.hw_enc() as u32)
            }
        };
        let class_field = vreg.class() as u8 as u32;
        Operand {
            bits: vreg.vreg() as u32
                | (preg_field << Self::PREG_SHIFT)
                | (class_field << Self::CLASS_SHIFT)
                | ((pos as u8 as u32) << Self::POS_SHIFT)
                | ((kind as u8 as u32) << Self::KIND_SHIFT)
                | (tag << Self::CONSTRAINT_SHIFT),
        }
    }

    /// A register use read before the instruction.
    #[inline(always)]
    pub fn reg_use(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Reg, OperandKind::Use, OperandPos::Early)
    }

    /// A register use that stays live until the instruction finishes.
    #[inline(always)]
    pub fn reg_use_at_end(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Reg, OperandKind::Use, OperandPos::Late)
    }

    /// A register def written when the instruction finishes.
    #[inline(always)]
    pub fn reg_def(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Reg, OperandKind::Def, OperandPos::Late)
    }

    /// A register def written as the instruction starts.
    #[inline(always)]
    pub fn reg_def_at_start(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Reg, OperandKind::Def, OperandPos::Early)
    }

    /// A scratch register for the duration of the instruction.
    #[inline(always)]
    pub fn reg_temp(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Reg, OperandKind::Temp, OperandPos::Early)
    }

    #[inline(always)]
    pub fn reg_fixed_use(vreg: VReg, preg: PReg) -> Self {
        Operand::new(
            vreg,
            OperandConstraint::FixedReg(preg),
            OperandKind::Use,
            OperandPos::Early,
        )
    }

    #[inline(always)]
    pub fn reg_fixed_def(vreg: VReg, preg: PReg) -> Self {
        Operand::new(
            vreg,
            OperandConstraint::FixedReg(preg),
            OperandKind::Def,
            OperandPos::Late,
        )
    }

    #[inline(always)]
    pub fn any_use(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Any, OperandKind::Use, OperandPos::Early)
    }

    #[inline(always)]
    pub fn any_def(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Any, OperandKind::Def, OperandPos::Late)
    }

    #[inline(always)]
    pub fn stack_use(vreg: VReg) -> Self {
        Operand::new(vreg, OperandConstraint::Stack, OperandKind::Use, OperandPos::Early)
    }

    #[inline(always)]
    pub fn vreg(self) -> VReg {
        VReg::new(
            (self.bits & VReg::MAX as u32) as usize,
            self.class(),
        )
    }

    #[inline(always)]
    pub fn class(self) -> RegClass {
        RegClass::from_index(((self.bits >> Self::CLASS_SHIFT) & 3) as usize)
    }

    #[inline(always)]
    pub fn kind(self) -> OperandKind {
        match (self.bits >> Self::KIND_SHIFT) & 3 {
            0 => OperandKind::Def,
            1 => OperandKind::Use,
            2 => OperandKind::Temp,
            _ => unreachable!(),
        }
    }

    #[inline(always)]
    pub fn pos(self) -> OperandPos {
        match (self.bits >> Self::POS_SHIFT) & 1 {
            0 => OperandPos::Early,
            _ => OperandPos::Late,
        }
    }

    #[inline(always)]
    pub fn constraint(self) -> OperandConstraint {
        match self.bits >> Self::CONSTRAINT_SHIFT {
            0 => OperandConstraint::Any,
            1 => OperandConstraint::Reg,
            2 => OperandConstraint::Stack,
            _ => {
                let hw_enc = (self.bits >> Self::PREG_SHIFT) as usize & PReg::MAX;
                OperandConstraint::FixedReg(PReg::new(hw_enc, self.class()))
            }
        }
    }

    /// The fixed register this operand is pinned to, if any.
    #[inline(always)]
    pub fn as_fixed_reg(self) -> Option<PReg> {
        match self.constraint() {
            OperandConstraint::FixedReg(preg) => Some(preg),
            _ => None,
        }
    }

    /// Program point at which this operand takes effect.
    #[inline(always)]
    pub fn point(self, inst: Inst) -> ProgPoint {
        match (self.kind(), self.pos()) {
            (OperandKind::Use, OperandPos::Early) => ProgPoint::before(inst),
            (OperandKind::Use, OperandPos::Late) => ProgPoint::after(inst),
            (OperandKind::Def, OperandPos::Late) => ProgPoint::after(inst),
            (OperandKind::Def, OperandPos::Early) | (OperandKind::Temp, _) => {
                ProgPoint::before(inst)
            }
        }
    }

    #[inline(always)]
    pub fn bits(self) -> u32 {
        self.bits
    }

    #[inline(always)]
    pub fn from_bits(bits: u32) -> Self {
        debug_assert!(bits >> Self::CLASS_SHIFT & 3 <= 2);
        debug_assert!(bits >> Self::KIND_SHIFT & 3 <= 2);
        Operand { bits }
    }
}

impl core::fmt::Debug for Operand {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let kind = match self.kind() {
            OperandKind::Def => "def",
            OperandKind::Use => "use",
            OperandKind::Temp => "temp",
        };
        let pos = match (self.kind(), self.pos()) {
            (OperandKind::Use, OperandPos::Late) => "@late",
            (OperandKind::Def, OperandPos::Early) => "@early",
            _ => "",
        };
        let class = match self.class() {
            RegClass::Int => "i",
            RegClass::Float => "f",
            RegClass::Vector => "v",
        };
        write!(
            f,
            "{}{} {}{}: {}",
            kind,
            pos,
            self.vreg(),
            class,
            self.constraint()
        )
    }
}

/// An Allocation represents the end result of regalloc for an
/// Operand.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Allocation {
    /// Bit-pack in 32 bits.
    ///
    /// kind:3 unused:5 index:24
    bits: u32,
}

/// Kind of an `Allocation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AllocationKind {
    None = 0,
    Reg = 1,
    Stack = 2,
}

impl Allocation {
    #[inline(always)]
    fn new(kind: AllocationKind, index: usize) -> Self {
        debug_assert!(index < (1 << 24));
        Self {
            bits: ((kind as u8 as u32) << 29) | (index as u32),
        }
    }

    #[inline(always)]
    pub fn none() -> Allocation {
        Allocation::new(AllocationKind::None, 0)
    }

    #[inline(always)]
    pub fn reg(preg: PReg) -> Allocation {
        Allocation::new(AllocationKind::Reg, preg.index())
    }

    #[inline(always)]
    pub fn stack(slot: SpillSlot) -> Allocation {
        Allocation::new(AllocationKind::Stack, slot.index())
    }

    #[inline(always)]
    pub fn kind(self) -> AllocationKind {
        match (self.bits >> 29) & 7 {
            0 => AllocationKind::None,
            1 => AllocationKind::Reg,
            2 => AllocationKind::Stack,
            _ => unreachable!(),
        }
    }

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self.kind() == AllocationKind::None
    }

    #[inline(always)]
    pub fn is_some(self) -> bool {
        self.kind() != AllocationKind::None
    }

    #[inline(always)]
    pub fn is_reg(self) -> bool {
        self.kind() == AllocationKind::Reg
    }

    #[inline(always)]
    pub fn is_stack(self) -> bool {
        self.kind() == AllocationKind::Stack
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        (self.bits & ((1 << 24) - 1)) as usize
    }

    #[inline(always)]
    pub fn as_reg(self) -> Option<PReg> {
        if self.kind() == AllocationKind::Reg {
            Some(PReg::from_index(self.index()))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_stack(self) -> Option<SpillSlot> {
        if self.kind() == AllocationKind::Stack {
            Some(SpillSlot::new(self.index()))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn bits(self) -> u32 {
        self.bits
    }

    #[inline(always)]
    pub fn from_bits(bits: u32) -> Self {
        debug_assert!(bits >> 29 <= AllocationKind::Stack as u32);
        Self { bits }
    }
}

impl core::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

impl core::fmt::Display for Allocation {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.kind() {
            AllocationKind::None => write!(f, "none"),
            AllocationKind::Reg => write!(f, "{}", PReg::from_index(self.index())),
            AllocationKind::Stack => write!(f, "{}", SpillSlot::new(self.index())),
        }
    }
}

/// A position before or after an instruction at which we can make an
/// edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InstPosition {
    Before = 0,
    After = 1,
}

/// A program point: a single point before or after a given instruction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ProgPoint {
    bits: u32,
}

impl core::fmt::Debug for ProgPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "progpoint{}{}",
            self.inst().index(),
            match self.pos() {
                InstPosition::Before => "-pre",
                InstPosition::After => "-post",
            }
        )
    }
}

impl ProgPoint {
    #[inline(always)]
    pub fn new(inst: Inst, pos: InstPosition) -> Self {
        let bits = (inst.0 << 1) | (pos as u8 as u32);
        Self { bits }
    }
    #[inline(always)]
    pub fn before(inst: Inst) -> Self {
        Self::new(inst, InstPosition::Before)
    }
    #[inline(always)]
    pub fn after(inst: Inst) -> Self {
        Self::new(inst, InstPosition::After)
    }
    #[inline(always)]
    pub fn inst(self) -> Inst {
        // Cast to i32 to do an arithmetic right-shift, which will
        // preserve an `Inst::invalid()` (which is -1, or all-ones).
        Inst::new(((self.bits as i32) >> 1) as usize)
    }
    #[inline(always)]
    pub fn pos(self) -> InstPosition {
        match self.bits & 1 {
            0 => InstPosition::Before,
            1 => InstPosition::After,
            _ => unreachable!(),
        }
    }
    #[inline(always)]
    pub fn next(self) -> ProgPoint {
        Self {
            bits: self.bits + 1,
        }
    }
    #[inline(always)]
    pub fn prev(self) -> ProgPoint {
        Self {
            bits: self.bits - 1,
        }
    }
    #[inline(always)]
    pub fn to_index(self) -> u32 {
        self.bits
    }
    #[inline(always)]
    pub fn from_index(index: u32) -> Self {
        Self { bits: index }
    }
    /// The point past every instruction; used as "never".
    #[inline(always)]
    pub fn max() -> Self {
        Self { bits: u32::MAX }
    }
}

/// An instruction to insert into the program to perform some data movement.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Edit {
    /// Move one allocation to another. Each allocation may be a
    /// register or a stack slot (spillslot). Stack-to-stack moves are
    /// only generated when the move factory allows them for `class`.
    Move {
        from: Allocation,
        to: Allocation,
        class: RegClass,
    },
}

/// Either an instruction or an edit, as produced by
/// `Output::block_insts_and_edits`.
#[derive(Clone, Debug)]
pub enum InstOrEdit<'a> {
    Inst(Inst),
    Edit(&'a Edit),
}

/// Iterator over the instructions and edits of one block.
pub struct OutputIter<'a> {
    edits: &'a [(ProgPoint, Edit)],
    insts: InstRange,
}

impl<'a> Iterator for OutputIter<'a> {
    type Item = InstOrEdit<'a>;

    fn next(&mut self) -> Option<InstOrEdit<'a>> {
        // Edits are only ever placed before an instruction of the
        // block, so the block's last instruction ends the sequence.
        if self.insts.is_empty() {
            return None;
        }
        let inst = self.insts.first();
        if let Some(((point, edit), rest)) = self.edits.split_first() {
            if *point <= ProgPoint::before(inst) {
                self.edits = rest;
                return Some(InstOrEdit::Edit(edit));
            }
        }
        self.insts = self.insts.rest();
        Some(InstOrEdit::Inst(inst))
    }
}

/// A machine environment tells the register allocator which registers
/// are available to allocate and what register may be used as a
/// scratch register for each class.
///
/// A register that is in neither the preferred nor the non-preferred
/// list of its class is reserved: the allocator never hands it out,
/// but it may still be named by fixed-register constraints and
/// clobbers.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MachineEnv {
    /// Preferred physical registers for each class. These are the
    /// registers that will be allocated first, if free.
    pub preferred_regs_by_class: [Vec<PReg>; 3],

    /// Non-preferred physical registers for each class. These are the
    /// registers that will be allocated if a preferred register is
    /// not available; using one of these is considered suboptimal,
    /// but still better than spilling.
    pub non_preferred_regs_by_class: [Vec<PReg>; 3],

    /// Optional dedicated scratch register per class, used to break
    /// cycles in parallel moves. It must not be allocatable. When it
    /// is absent, a free register is searched for at each move site
    /// and a spare spill slot is used as the last resort.
    pub scratch_by_class: [Option<PReg>; 3],
}

impl MachineEnv {
    /// All allocatable registers of `class`, preferred ones first.
    pub fn allocatable_regs(&self, class: RegClass) -> impl Iterator<Item = PReg> + '_ {
        self.preferred_regs_by_class[class.index()]
            .iter()
            .chain(self.non_preferred_regs_by_class[class.index()].iter())
            .copied()
    }

    pub fn is_allocatable(&self, preg: PReg) -> bool {
        self.allocatable_regs(preg.class()).any(|r| r == preg)
    }

    pub fn has_allocatable_regs(&self, class: RegClass) -> bool {
        self.allocatable_regs(class).next().is_some()
    }
}

/// A Function abstracts the input program: blocks of instructions,
/// the CFG between blocks, and each instruction's operands.
///
/// The allocator requires SSA form: every vreg has exactly one
/// definition (an operand of kind `Def` or `Temp`, or a block
/// parameter). Critical edges must be split, and every block ends in
/// a branch or a return.
pub trait Function {
    // -------------
    // CFG traversal
    // -------------

    /// How many instructions are there?
    fn num_insts(&self) -> usize;

    /// How many blocks are there?
    fn num_blocks(&self) -> usize;

    /// Get the index of the entry block.
    fn entry_block(&self) -> Block;

    /// Provide the range of instruction indices contained in each block.
    fn block_insns(&self, block: Block) -> InstRange;

    /// Get CFG successors for a given block.
    fn block_succs(&self, block: Block) -> &[Block];

    /// Get the CFG predecessors for a given block.
    fn block_preds(&self, block: Block) -> &[Block];

    /// Get the block parameters for a given block.
    fn block_params(&self, block: Block) -> &[VReg];

    /// Determine whether an instruction is a return instruction.
    fn is_ret(&self, insn: Inst) -> bool;

    /// Determine whether an instruction is the end-of-block
    /// branch.
    fn is_branch(&self, insn: Inst) -> bool;

    /// If `insn` is a branch at the end of `block`, returns the
    /// outgoing blockparam arguments for the given successor. The
    /// number of arguments must match the number of blockparams on
    /// that successor.
    fn branch_blockparams(&self, block: Block, insn: Inst, succ_idx: usize) -> &[VReg];

    // --------------------------
    // Instruction register slots
    // --------------------------

    /// Get the Operands for an instruction.
    fn inst_operands(&self, insn: Inst) -> &[Operand];

    /// Get the clobbers for an instruction: physical registers that
    /// the instruction overwrites without naming them as operands,
    /// such as the caller-saved registers of a call.
    fn inst_clobbers(&self, insn: Inst) -> PRegSet;

    /// Get the number of `VReg` in use in this function.
    fn num_vregs(&self) -> usize;

    // --------------
    // Spills/reloads
    // --------------

    /// How many logical spill slots does the given regclass require?
    /// The allocator always aligns slots on this size.
    fn spillslot_size(&self, regclass: RegClass) -> usize;

    /// When providing a spillslot number for a multi-slot spillslot,
    /// do we provide the first or the last?
    fn multi_spillslot_named_by_last_slot(&self) -> bool {
        false
    }
}

/// Location of a value over a range of program points of one trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VRegLocation {
    pub vreg: VReg,
    pub trace: TraceId,
    /// First point covered (inclusive).
    pub from: ProgPoint,
    /// End of the range (exclusive).
    pub to: ProgPoint,
    pub alloc: Allocation,
}

/// Resolution state of one control-flow edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum EdgeState {
    /// Locations on both sides have not been compared yet.
    Unresolved,
    /// At least one value changes location; moves are pending.
    MoveScheduled,
    /// Every value has matching locations or an emitted move.
    Resolved,
}

/// The moves required on one control-flow edge.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct EdgeResolution {
    pub from: Block,
    pub to: Block,
    pub from_trace: TraceId,
    pub to_trace: TraceId,
    pub state: EdgeState,
    /// Where the moves were inserted: before the predecessor's branch
    /// or at the head of the successor.
    pub point: ProgPoint,
    /// Parallel moves `(from, to, vreg)`, `vreg` being the value that
    /// arrives in `to`.
    pub moves: Vec<(Allocation, Allocation, VReg)>,
}

impl EdgeResolution {
    /// Does this edge connect two different traces?
    pub fn crosses_traces(&self) -> bool {
        self.from_trace != self.to_trace
    }
}

/// The output of the register allocator.
#[derive(Clone, Debug, Default)]
pub struct Output {
    /// How many spillslots are needed in the frame?
    pub num_spillslots: usize,

    /// Edits (moves to insert). Guaranteed to be sorted by program
    /// point; edits at one point must be performed in order.
    pub edits: Vec<(ProgPoint, Edit)>,

    /// Allocations for each operand. Mapping from instruction to
    /// allocations provided by `inst_alloc_offsets` below.
    pub allocs: Vec<Allocation>,

    /// Allocation offset in `allocs` for each instruction.
    pub inst_alloc_offsets: Vec<u32>,

    /// Where each value lives, per trace and range. Sorted by vreg
    /// and program point.
    pub vreg_locations: Vec<VRegLocation>,

    /// One record per control-flow edge, in trace order.
    pub edges: Vec<EdgeResolution>,

    /// Internal stats from the allocator.
    pub stats: Stats,
}

impl Output {
    /// Get the allocations assigned to a given instruction.
    pub fn inst_allocs(&self, inst: Inst) -> &[Allocation] {
        let start = self.inst_alloc_offsets[inst.index()] as usize;
        let end = if inst.index() + 1 == self.inst_alloc_offsets.len() {
            self.allocs.len()
        } else {
            self.inst_alloc_offsets[inst.index() + 1] as usize
        };
        &self.allocs[start..end]
    }

    /// Returns an iterator over the instructions and edits in a block, in
    /// order.
    pub fn block_insts_and_edits(&self, func: &impl Function, block: Block) -> OutputIter<'_> {
        let insts = func.block_insns(block);
        let start = if insts.is_empty() {
            self.edits.len()
        } else {
            self.edits
                .partition_point(|&(point, _)| point < ProgPoint::before(insts.first()))
        };
        OutputIter {
            edits: &self.edits[start..],
            insts,
        }
    }

    /// Where `vreg` lives at `point`, if it is live there.
    pub fn vreg_location_at(&self, vreg: VReg, point: ProgPoint) -> Option<Allocation> {
        let start = self
            .vreg_locations
            .partition_point(|loc| (loc.vreg, loc.to) <= (vreg, point));
        self.vreg_locations[start..]
            .first()
            .filter(|loc| loc.vreg == vreg && loc.from <= point)
            .map(|loc| loc.alloc)
    }

    /// Turn every edit into a client move instruction.
    pub fn emit_moves<M: MoveFactory>(&self, factory: &M) -> Vec<(ProgPoint, M::Move)> {
        self.edits
            .iter()
            .map(|(point, edit)| match *edit {
                Edit::Move { from, to, class } => (*point, factory.create_move(from, to, class)),
            })
            .collect()
    }
}

/// An error that prevents allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    /// Critical edge is not split between given blocks.
    CritEdge(Block, Block),
    /// Invalid SSA for given vreg at given inst: multiple defs or
    /// illegal use. `inst` may be `Inst::invalid()` if this concerns
    /// a block param.
    SSA(VReg, Inst),
    /// Invalid basic block: does not end in branch/ret, or contains a
    /// branch/ret in the middle, or is unreachable from the entry.
    BB(Block),
    /// Invalid branch: argument count does not match the block
    /// params of a successor block.
    Branch(Inst),
    /// A VReg is live-in on entry: it is used without any definition
    /// reaching it.
    EntryLivein,
    /// A branch has operands and a successor has more than one
    /// predecessor, forcing edge moves before the branch. Insert an
    /// edge block to avoid the situation.
    DisallowedBranchArg(Inst),
    /// The trace list does not cover every block exactly once, or a
    /// trace is not a single-entry path in instruction order.
    InvalidTrace(TraceId),
    /// A register-constrained operand names a class that has no
    /// allocatable register.
    NoRegistersForClass(RegClass),
    /// One vreg is given incompatible constraints at one instruction.
    ConflictingConstraints(VReg, Inst),
    /// Two different values (or a value and a clobber) require the
    /// same physical register at the same point.
    FixedRegConflict(PReg, Inst),
    /// Too many Reg-constrained operands are live at once, making
    /// allocation impossible.
    TooManyLiveRegs,
    /// A stack-to-stack move was needed in a class that has no
    /// register to route it through.
    NoScratch(RegClass),
}

impl core::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegAllocError {}

/// Allocate registers for every trace of `ctx.traces`, in order, and
/// reconcile value locations across every control-flow edge.
pub fn run<F: Function, M: MoveFactory>(
    func: &F,
    ctx: &AllocationContext<'_, M>,
    options: &RegallocOptions,
) -> Result<Output, RegAllocError> {
    lsra::run(func, ctx, options)
}

/// Options for allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegallocOptions {
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,

    /// Run the SSA validator before allocating.
    pub validate_ssa: bool,
}

pub(crate) trait VecExt<T> {
    /// Fills `self` with `len` copies of `value` and returns it as a
    /// slice, reusing the existing allocation.
    fn repopulate(&mut self, len: usize, value: T) -> &mut [T]
    where
        T: Clone;

    /// Clears `self` and returns it for chaining.
    fn cleared(&mut self) -> &mut Self;
}

impl<T> VecExt<T> for Vec<T> {
    fn repopulate(&mut self, len: usize, value: T) -> &mut [T]
    where
        T: Clone,
    {
        self.clear();
        self.resize(len, value);
        self
    }

    fn cleared(&mut self) -> &mut Self {
        self.clear();
        self
    }
}
