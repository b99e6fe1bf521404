/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Trace linear-scan allocator.
//!
//! Traces are processed one at a time in builder order. For each
//! trace we build one root interval per value mentioned in it, then
//! run a linear scan that assigns registers, splits and spills. Once
//! every trace is done, spill slots are assigned and moves are
//! inserted wherever a value changes location: inside a trace at
//! split points, and across every control-flow edge.

use crate::cfg::CFGInfo;
use crate::context::{AllocationContext, MoveFactory};
use crate::{
    Allocation, Function, Output, PReg, RegAllocError, RegClass, RegallocOptions, TraceId,
    VRegLocation,
};
use alloc::vec::Vec;
use smallvec::smallvec;

pub(crate) mod data_structures;
pub use data_structures::Stats;
use data_structures::*;
pub(crate) mod dump;
pub(crate) mod intervals;
pub(crate) mod liveness;
pub(crate) mod reg_traversal;
pub(crate) mod resolve;
pub(crate) mod scan;
pub(crate) mod spill;
pub(crate) mod split;

#[cfg(test)]
mod tests;

impl<'a, F: Function> Env<'a, F> {
    pub(crate) fn new<M: MoveFactory>(
        func: &'a F,
        ctx: &AllocationContext<'a, M>,
        cfginfo: CFGInfo,
    ) -> Self {
        let n = func.num_insts();
        let mut pregs = Vec::new();
        pregs.resize(PReg::NUM_INDEX, PRegData::default());
        Self {
            func,
            env: ctx.env,
            traces: ctx.traces,
            stack_to_stack_ok: [
                ctx.move_factory.allows_stack_to_stack(RegClass::Int),
                ctx.move_factory.allows_stack_to_stack(RegClass::Float),
                ctx.move_factory.allows_stack_to_stack(RegClass::Vector),
            ],
            cfginfo,
            liveins: Vec::with_capacity(func.num_blocks()),
            liveouts: Vec::with_capacity(func.num_blocks()),

            vregs: Vec::with_capacity(func.num_vregs()),
            intervals: Intervals::with_capacity(n),
            pregs,
            unhandled: UnhandledQueue::default(),
            bump: bumpalo::Bump::new(),

            spillslots: Vec::new(),
            slots_by_size: Vec::new(),
            extra_spillslots_by_class: [smallvec![], smallvec![], smallvec![]],
            num_spillslots: 0,

            multi_fixed_reg_fixups: Vec::new(),
            pending_moves: Vec::new(),
            edges: Vec::new(),

            edits: Vec::new(),
            allocs: Vec::with_capacity(4 * n),
            inst_alloc_offsets: Vec::with_capacity(n),
            stats: Stats::default(),
        }
    }

    pub(crate) fn init(&mut self) -> Result<(), RegAllocError> {
        self.create_vregs()?;
        self.compute_liveness()?;
        for inst in 0..self.func.num_insts() {
            self.inst_alloc_offsets.push(self.allocs.len() as u32);
            let n = self.func.inst_operands(crate::Inst::new(inst)).len();
            self.allocs
                .extend(core::iter::repeat(Allocation::none()).take(n));
        }
        Ok(())
    }

    /// Allocate every trace, in builder order.
    pub(crate) fn allocate_traces(&mut self) -> Result<(), RegAllocError> {
        for i in 0..self.traces.num_traces() {
            let trace = TraceId::new(i);
            let first = IntervalIndex::new(self.intervals.len());
            let roots = self.build_intervals(trace)?;
            if trace_enabled!() {
                self.dump_intervals(first);
            }
            self.allocate_trace(trace, &roots)?;
            if cfg!(feature = "checker") {
                self.verify_trace(first);
            }
            self.commit_trace(first);
            self.stats.traces += 1;
        }
        self.stats.final_interval_count = self.intervals.len();
        Ok(())
    }

    pub(crate) fn run(&mut self) -> Result<(), RegAllocError> {
        self.allocate_traces()?;
        self.collect_moves();
        self.allocate_spillslots();
        self.apply_allocations();
        self.insert_moves()?;
        Ok(())
    }

    /// Every range of every interval with its final location, sorted
    /// by value and position.
    fn vreg_locations(&self) -> Vec<VRegLocation> {
        let mut locs: Vec<VRegLocation> = self
            .intervals
            .iter()
            .flat_map(|iv| {
                iv.ranges.iter().map(move |r| VRegLocation {
                    vreg: iv.vreg,
                    trace: iv.trace,
                    from: r.from,
                    to: r.to,
                    alloc: iv.alloc,
                })
            })
            .collect();
        locs.sort_unstable_by_key(|loc| (loc.vreg, loc.from));
        locs
    }
}

pub fn run<F: Function, M: MoveFactory>(
    func: &F,
    ctx: &AllocationContext<'_, M>,
    options: &RegallocOptions,
) -> Result<Output, RegAllocError> {
    let cfginfo = CFGInfo::new(func)?;

    if options.validate_ssa {
        liveness::validate_ssa(func, &cfginfo)?;
    }

    let mut env = Env::new(func, ctx, cfginfo);
    env.init()?;
    env.run()?;

    if options.verbose_log {
        env.dump_results();
        log::info!("{:?}", env.stats);
    }

    Ok(Output {
        num_spillslots: env.num_spillslots as usize,
        vreg_locations: env.vreg_locations(),
        edits: env.edits,
        allocs: env.allocs,
        inst_alloc_offsets: env.inst_alloc_offsets,
        edges: env.edges,
        stats: env.stats,
    })
}
