/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::checker::Checker;
use crate::fuzzing::func::{machine_env, Func, FuncBuilder};
use crate::trace::TraceBuilderResult;
use crate::{
    Block, EdgeState, Edit, EditMoveFactory, Inst, MachineEnv, MoveFactory, Operand, PRegSet,
    ProgPoint, VReg,
};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

fn v(n: usize) -> VReg {
    VReg::new(n, RegClass::Int)
}

fn p(n: usize) -> PReg {
    PReg::new(n, RegClass::Int)
}

fn r(n: usize) -> Allocation {
    Allocation::reg(p(n))
}

fn before(i: usize) -> ProgPoint {
    ProgPoint::before(Inst::new(i))
}

/// `n` preferred integer registers and nothing else.
fn int_env(n: usize) -> MachineEnv {
    MachineEnv {
        preferred_regs_by_class: [(0..n).map(p).collect(), vec![], vec![]],
        non_preferred_regs_by_class: [vec![], vec![], vec![]],
        scratch_by_class: [None, None, None],
    }
}

fn try_allocate(
    f: &Func,
    env: &MachineEnv,
    traces: &TraceBuilderResult,
) -> Result<Output, RegAllocError> {
    try_allocate_with(f, env, traces, &EditMoveFactory, true)
}

fn try_allocate_with<M: MoveFactory>(
    f: &Func,
    env: &MachineEnv,
    traces: &TraceBuilderResult,
    factory: &M,
    validate_ssa: bool,
) -> Result<Output, RegAllocError> {
    let ctx = AllocationContext::new(factory, env, traces);
    let options = RegallocOptions {
        verbose_log: false,
        validate_ssa,
    };
    run(f, &ctx, &options)
}

/// Allocate and check the result.
fn allocate(f: &Func, env: &MachineEnv, traces: &TraceBuilderResult) -> Output {
    let out = try_allocate(f, env, traces).expect("allocation failed");
    let mut checker = Checker::new(f);
    checker.prepare(&out);
    if let Err(e) = checker.run() {
        panic!("checker failed: {:?}\n{:?}", e, f);
    }
    out
}

fn moves(out: &Output) -> Vec<(ProgPoint, Allocation, Allocation)> {
    out.edits
        .iter()
        .map(|(pos, Edit::Move { from, to, .. })| (*pos, *from, *to))
        .collect()
}

/// v0 is defined first and read last; v1 lives in between.
fn two_values() -> Func {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_inst(b0, &[Operand::reg_def(v(1))]);
    b.push_inst(b0, &[Operand::reg_use(v(1))]);
    b.push_inst(b0, &[Operand::reg_use(v(0))]);
    b.push_ret(b0, &[]);
    b.finish()
}

/// A loop with a diamond inside, block parameters on the loop header
/// and the join, a call clobbering registers, fixed and stack
/// operands.
fn loop_func() -> Func {
    let mut b = FuncBuilder::new();
    let bs: Vec<Block> = (0..7).map(|_| b.add_block()).collect();
    for &(from, to) in &[(0, 1), (1, 2), (1, 3), (2, 4), (3, 4), (4, 5), (4, 6), (5, 1)] {
        b.add_edge(bs[from], bs[to]);
    }
    b.set_block_params(bs[1], &[v(3)]);
    b.set_block_params(bs[4], &[v(7)]);

    b.push_inst(bs[0], &[Operand::reg_def(v(0))]);
    b.push_inst(bs[0], &[Operand::reg_def(v(1))]);
    b.push_inst(bs[0], &[Operand::any_def(v(2))]);
    b.push_branch(bs[0], &[], &[vec![v(0)]]);

    b.push_inst(
        bs[1],
        &[
            Operand::reg_def(v(4)),
            Operand::reg_use(v(3)),
            Operand::reg_use(v(1)),
        ],
    );
    b.push_branch(bs[1], &[], &[vec![], vec![]]);

    b.push_inst(
        bs[2],
        &[
            Operand::reg_def(v(5)),
            Operand::reg_use(v(4)),
            Operand::any_use(v(2)),
        ],
    );
    b.push_inst(bs[2], &[Operand::stack_use(v(1))]);
    b.push_branch(bs[2], &[], &[vec![v(5)]]);

    b.push_inst(
        bs[3],
        &[Operand::reg_fixed_def(v(6), p(0)), Operand::reg_use(v(4))],
    );
    b.push_call(
        bs[3],
        &[Operand::reg_use(v(6))],
        PRegSet::empty().with(p(1)).with(p(2)),
    );
    b.push_branch(bs[3], &[], &[vec![v(6)]]);

    b.push_inst(bs[4], &[Operand::reg_use(v(7)), Operand::reg_use(v(1))]);
    b.push_branch(bs[4], &[], &[vec![], vec![]]);

    b.push_branch(bs[5], &[], &[vec![v(7)]]);

    b.push_ret(
        bs[6],
        &[Operand::reg_fixed_use(v(7), p(0)), Operand::any_use(v(2))],
    );
    b.finish()
}

#[test]
fn farthest_use_is_spilled_with_one_register() {
    let f = two_values();
    let env = int_env(1);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let out = allocate(&f, &env, &traces);

    // v0 is read last, so it gives up the register to v1 and comes
    // back before inst3.
    assert_eq!(out.inst_allocs(Inst::new(1)), &[r(0)]);
    assert_eq!(out.inst_allocs(Inst::new(3)), &[r(0)]);
    assert!(out.vreg_location_at(v(0), before(2)).unwrap().is_stack());
    assert_eq!(out.vreg_location_at(v(1), before(2)), Some(r(0)));
    assert_eq!(out.stats.spilled_intervals, 1);

    let moves = moves(&out);
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[0].0, before(1));
    assert_eq!(moves[0].1, r(0));
    assert!(moves[0].2.is_stack());
    assert_eq!(moves[1], (before(3), moves[0].2, r(0)));
    assert_eq!(out.num_spillslots, 1);
}

#[test]
fn second_register_avoids_spilling() {
    let f = two_values();
    let env = int_env(2);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let out = allocate(&f, &env, &traces);
    assert!(out.edits.is_empty());
    assert_eq!(out.stats.spilled_intervals, 0);
    assert_ne!(out.inst_allocs(Inst::new(0)), out.inst_allocs(Inst::new(1)));
}

#[test]
fn fixed_register_is_honored() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_fixed_def(v(0), p(0))]);
    b.push_inst(b0, &[Operand::reg_def(v(1))]);
    b.push_inst(b0, &[Operand::reg_fixed_use(v(0), p(0))]);
    b.push_call(b0, &[], PRegSet::empty().with(p(0)));
    b.push_inst(b0, &[Operand::reg_use(v(1))]);
    b.push_ret(b0, &[]);
    let f = b.finish();

    let env = int_env(2);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let out = allocate(&f, &env, &traces);

    assert_eq!(out.inst_allocs(Inst::new(0)), &[r(0)]);
    assert_eq!(out.inst_allocs(Inst::new(2)), &[r(0)]);
    // v1 overlaps v0 and lives across the clobber of p0.
    for loc in out.vreg_locations.iter().filter(|loc| loc.vreg == v(1)) {
        assert_ne!(loc.alloc, r(0), "{:?}", loc);
    }
    assert_eq!(out.inst_allocs(Inst::new(4)), &[r(1)]);
    assert!(out.edits.is_empty());
}

#[test]
fn one_move_between_traces() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    let b1 = b.add_block();
    b.add_edge(b0, b1);
    b.push_inst(b0, &[Operand::reg_fixed_def(v(0), p(1))]);
    b.push_branch(b0, &[], &[vec![]]);
    b.push_inst(b1, &[Operand::reg_fixed_use(v(0), p(2))]);
    b.push_ret(b1, &[]);
    let f = b.finish();

    let env = int_env(3);
    let traces = TraceBuilderResult::new(&f, vec![vec![b0], vec![b1]]).unwrap();
    let out = allocate(&f, &env, &traces);

    assert_eq!(out.edges.len(), 1);
    let edge = &out.edges[0];
    assert!(edge.crosses_traces());
    assert_eq!(edge.state, EdgeState::Resolved);
    assert_eq!(edge.point, before(2));
    assert_eq!(edge.moves, vec![(r(1), r(2), v(0))]);
    assert_eq!(moves(&out), vec![(before(2), r(1), r(2))]);
    assert_eq!(out.stats.edge_moves, 1);
}

#[test]
fn successor_trace_keeps_predecessor_register() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    let b1 = b.add_block();
    b.add_edge(b0, b1);
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_branch(b0, &[], &[vec![]]);
    b.push_inst(b1, &[Operand::reg_use(v(0))]);
    b.push_ret(b1, &[]);
    let f = b.finish();

    let env = int_env(4);
    let traces = TraceBuilderResult::single_block(&f).unwrap();
    let out = allocate(&f, &env, &traces);
    assert_eq!(out.inst_allocs(Inst::new(0)), out.inst_allocs(Inst::new(2)));
    assert!(out.edges[0].moves.is_empty());
    assert!(out.edits.is_empty());
}

#[test]
fn loop_passes_checker() {
    let f = loop_func();
    for env in [int_env(3), int_env(4), machine_env()] {
        for traces in [
            TraceBuilderResult::unidirectional(&f).unwrap(),
            TraceBuilderResult::single_block(&f).unwrap(),
        ] {
            let out = allocate(&f, &env, &traces);
            assert!(out.edges.iter().all(|e| e.state == EdgeState::Resolved));
            assert_eq!(out.stats.traces, traces.num_traces());
        }
    }
}

#[test]
fn no_register_overlap() {
    let f = loop_func();
    let env = int_env(3);
    let traces = TraceBuilderResult::single_block(&f).unwrap();
    let out = allocate(&f, &env, &traces);
    let in_regs: Vec<_> = out
        .vreg_locations
        .iter()
        .filter(|loc| loc.alloc.is_reg())
        .collect();
    for (i, a) in in_regs.iter().enumerate() {
        for b in &in_regs[i + 1..] {
            if a.alloc == b.alloc && a.vreg != b.vreg {
                assert!(
                    a.to <= b.from || b.to <= a.from,
                    "{:?} overlaps {:?}",
                    a,
                    b
                );
            }
        }
    }
}

fn merged(mut ranges: Vec<CodeRange>) -> Vec<CodeRange> {
    ranges.sort_by_key(|r| r.from);
    let mut out: Vec<CodeRange> = Vec::new();
    for r in ranges {
        match out.last_mut() {
            Some(last) if last.to >= r.from => last.to = core::cmp::max(last.to, r.to),
            _ => out.push(r),
        }
    }
    out
}

#[test]
fn split_children_cover_the_original_interval() {
    let f = loop_func();
    let env = int_env(3);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let ctx = AllocationContext::new(&EditMoveFactory, &env, &traces);

    let mut allocated = Env::new(&f, &ctx, CFGInfo::new(&f).unwrap());
    allocated.init().unwrap();
    allocated.run().unwrap();
    assert!(allocated.stats.splits > 0);

    let mut built = Env::new(&f, &ctx, CFGInfo::new(&f).unwrap());
    built.init().unwrap();
    for t in 0..traces.num_traces() {
        built.build_intervals(TraceId::new(t)).unwrap();
    }

    for (data, original) in allocated.vregs.iter().zip(built.vregs.iter()) {
        assert_eq!(data.roots.len(), original.roots.len());
        for (&root, &orig) in data.roots.iter().zip(original.roots.iter()) {
            let family: Vec<CodeRange> = core::iter::once(root)
                .chain(allocated.intervals[root].children.iter().copied())
                .flat_map(|iv| allocated.intervals[iv].ranges.iter().copied())
                .collect();
            let expected: Vec<CodeRange> = built.intervals[orig].ranges.iter().copied().collect();
            assert_eq!(merged(family), expected, "{}", data.vreg);
        }
    }
}

#[test]
fn allocation_is_deterministic() {
    let f = loop_func();
    let env = int_env(3);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let a = allocate(&f, &env, &traces);
    let b = allocate(&f, &env, &traces);
    assert_eq!(a.allocs, b.allocs);
    assert_eq!(a.edits, b.edits);
    assert_eq!(a.vreg_locations, b.vreg_locations);
    assert_eq!(a.num_spillslots, b.num_spillslots);
}

#[test]
fn parallel_runs_share_one_context() {
    let f = loop_func();
    let env = int_env(3);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let expected = allocate(&f, &env, &traces);
    let ctx = AllocationContext::new(&EditMoveFactory, &env, &traces);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| run(&f, &ctx, &RegallocOptions::default()).unwrap()))
            .collect();
        for h in handles {
            let out = h.join().unwrap();
            assert_eq!(out.allocs, expected.allocs);
            assert_eq!(out.edits, expected.edits);
        }
    });
}

#[test]
fn too_many_register_uses() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_inst(b0, &[Operand::reg_def(v(1))]);
    b.push_inst(b0, &[Operand::reg_use(v(0)), Operand::reg_use(v(1))]);
    b.push_ret(b0, &[]);
    let f = b.finish();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate(&f, &int_env(1), &traces).unwrap_err(),
        RegAllocError::TooManyLiveRegs
    );
}

#[test]
fn operand_errors() {
    let vec0 = VReg::new(0, RegClass::Vector);
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_def(vec0)]);
    b.push_ret(b0, &[Operand::reg_use(vec0)]);
    let f = b.finish();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate(&f, &machine_env(), &traces).unwrap_err(),
        RegAllocError::NoRegistersForClass(RegClass::Vector)
    );

    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(
        b0,
        &[
            Operand::reg_fixed_def(v(0), p(0)),
            Operand::reg_fixed_def(v(1), p(0)),
        ],
    );
    b.push_ret(b0, &[Operand::reg_use(v(0)), Operand::reg_use(v(1))]);
    let f = b.finish();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate(&f, &machine_env(), &traces).unwrap_err(),
        RegAllocError::FixedRegConflict(p(0), Inst::new(0))
    );

    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_inst(b0, &[Operand::stack_use(v(0)), Operand::reg_use(v(0))]);
    b.push_ret(b0, &[]);
    let f = b.finish();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate(&f, &machine_env(), &traces).unwrap_err(),
        RegAllocError::ConflictingConstraints(v(0), Inst::new(1))
    );
}

#[test]
fn value_live_into_entry() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_ret(b0, &[Operand::reg_use(v(0))]);
    let f = b.finish();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let env = int_env(2);
    assert_eq!(
        try_allocate_with(&f, &env, &traces, &EditMoveFactory, false).unwrap_err(),
        RegAllocError::EntryLivein
    );
    assert_eq!(
        try_allocate(&f, &env, &traces).unwrap_err(),
        RegAllocError::SSA(v(0), Inst::new(0))
    );
}

#[test]
fn vreg_out_of_range_without_validation() {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_inst(b0, &[Operand::reg_def(v(3))]);
    b.push_ret(b0, &[Operand::reg_use(v(0)), Operand::reg_use(v(3))]);
    let mut f = b.finish();
    f.num_vregs = 2;
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate_with(&f, &int_env(2), &traces, &EditMoveFactory, false).unwrap_err(),
        RegAllocError::SSA(v(3), Inst::new(1))
    );

    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    let b1 = b.add_block();
    b.add_edge(b0, b1);
    b.set_block_params(b1, &[v(5)]);
    b.push_inst(b0, &[Operand::reg_def(v(0))]);
    b.push_branch(b0, &[], &[vec![v(0)]]);
    b.push_ret(b1, &[Operand::reg_use(v(5))]);
    let mut f = b.finish();
    f.num_vregs = 1;
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate_with(&f, &int_env(2), &traces, &EditMoveFactory, false).unwrap_err(),
        RegAllocError::SSA(v(5), Inst::invalid())
    );
}

fn fl(n: usize) -> VReg {
    VReg::new(n, RegClass::Float)
}

/// Two float values passed swapped to the parameters of the next
/// block. With no float registers every value lives on the stack, so
/// each parameter move goes from one slot to another.
fn swapped_float_args() -> Func {
    let mut b = FuncBuilder::new();
    let b0 = b.add_block();
    let b1 = b.add_block();
    b.add_edge(b0, b1);
    b.set_block_params(b1, &[fl(2), fl(3)]);
    b.push_inst(b0, &[Operand::any_def(fl(0))]);
    b.push_inst(b0, &[Operand::any_def(fl(1))]);
    b.push_branch(b0, &[], &[vec![fl(1), fl(0)]]);
    b.push_ret(b1, &[Operand::any_use(fl(2)), Operand::any_use(fl(3))]);
    b.finish()
}

#[test]
fn stack_to_stack_without_registers_fails() {
    let f = swapped_float_args();
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    assert_eq!(
        try_allocate(&f, &int_env(2), &traces).unwrap_err(),
        RegAllocError::NoScratch(RegClass::Float)
    );
}

/// Records every move it builds, and copies between stack slots of
/// `direct_class` without a register.
struct RecordingMoveFactory {
    direct_class: Option<RegClass>,
    built: RefCell<Vec<(Allocation, Allocation, RegClass)>>,
}

impl RecordingMoveFactory {
    fn new(direct_class: Option<RegClass>) -> Self {
        Self {
            direct_class,
            built: RefCell::new(Vec::new()),
        }
    }
}

impl MoveFactory for RecordingMoveFactory {
    type Move = (Allocation, Allocation, RegClass);

    fn create_move(&self, from: Allocation, to: Allocation, class: RegClass) -> Self::Move {
        self.built.borrow_mut().push((from, to, class));
        (from, to, class)
    }

    fn allows_stack_to_stack(&self, class: RegClass) -> bool {
        self.direct_class == Some(class)
    }
}

#[test]
fn emitted_moves_follow_edits() {
    let f = loop_func();
    let env = int_env(3);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let factory = RecordingMoveFactory::new(None);
    let out = try_allocate_with(&f, &env, &traces, &factory, true).unwrap();
    assert!(!out.edits.is_empty());
    assert!(factory.built.borrow().is_empty());

    let emitted = out.emit_moves(&factory);
    let expected: Vec<_> = out
        .edits
        .iter()
        .map(|&(pos, Edit::Move { from, to, class })| (pos, (from, to, class)))
        .collect();
    assert_eq!(emitted, expected);
    let built = factory.built.borrow();
    assert_eq!(built.len(), out.edits.len());
    assert!(built.iter().all(|&(from, to, _)| !(from.is_stack() && to.is_stack())));
}

#[test]
fn factory_allows_direct_stack_moves() {
    let f = swapped_float_args();
    let env = int_env(2);
    let traces = TraceBuilderResult::unidirectional(&f).unwrap();
    let factory = RecordingMoveFactory::new(Some(RegClass::Float));
    let out = try_allocate_with(&f, &env, &traces, &factory, true).unwrap();

    let mut checker = Checker::new(&f);
    checker.prepare(&out);
    if let Err(e) = checker.run() {
        panic!("checker failed: {:?}", e);
    }

    let direct: Vec<_> = out
        .edits
        .iter()
        .filter(|(_, Edit::Move { from, to, class })| {
            from.is_stack() && to.is_stack() && *class == RegClass::Float
        })
        .collect();
    assert_eq!(direct.len(), 2);
    assert!(out.edits.iter().all(|(_, Edit::Move { from, to, .. })| {
        !from.is_reg() && !to.is_reg()
    }));
    assert_eq!(out.stats.stack_to_stack_moves, 2);

    let emitted = out.emit_moves(&factory);
    assert_eq!(emitted.len(), out.edits.len());
    assert!(emitted
        .iter()
        .any(|(_, (from, to, class))| from.is_stack() && to.is_stack() && *class == RegClass::Float));
}
