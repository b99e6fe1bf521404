/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Debugging output.

use super::{Env, IntervalIndex};
use crate::{Block, Function, ProgPoint};
use alloc::format;
use alloc::string::String;

impl<'a, F: Function> Env<'a, F> {
    /// Log the intervals built for one trace, starting at `first`.
    pub fn dump_intervals(&self, first: IntervalIndex) {
        trace!("Intervals:");
        for i in first.index()..self.intervals.len() {
            let iv = &self.intervals[IntervalIndex::new(i)];
            let mut s = format!("interval{}: {} trace{}", i, iv.vreg, iv.trace.index());
            if iv.hint.is_valid() {
                s += &format!(" hint={}", iv.hint);
            }
            if iv.trivial {
                s += " dead";
            }
            for r in iv.ranges.iter() {
                s += &format!(" [{:?}, {:?})", r.from, r.to);
            }
            for u in iv.uses.iter() {
                s += &format!(" {:?}:{}", u.pos, u.operand);
            }
            trace!("{}", s);
        }
    }

    /// Log the function with final allocations and edits interleaved.
    pub fn dump_results(&self) {
        log::info!("=== REGALLOC RESULTS ===");
        for trace in self.traces.traces() {
            log::info!(
                "trace{}: [preds: {:?} succs: {:?}]",
                trace.id().index(),
                self.traces.predecessor_traces(self.func, trace.id()),
                self.traces.successor_traces(self.func, trace.id()),
            );
            for &block in trace.blocks() {
                self.dump_block(block);
            }
        }
        for edge in self.edges.iter() {
            if edge.moves.is_empty() {
                continue;
            }
            let mut s = String::new();
            for (from, to, vreg) in edge.moves.iter() {
                s += &format!(" {}:{}->{}", vreg, from, to);
            }
            log::info!(
                "edge block{} -> block{} at {:?}:{}",
                edge.from.index(),
                edge.to.index(),
                edge.point,
                s
            );
        }
    }

    fn dump_block(&self, block: Block) {
        log::info!(
            "  block{}: [preds: {:?} succs: {:?}]",
            block.index(),
            self.func
                .block_preds(block)
                .iter()
                .map(|b| b.index())
                .collect::<alloc::vec::Vec<_>>(),
            self.func
                .block_succs(block)
                .iter()
                .map(|b| b.index())
                .collect::<alloc::vec::Vec<_>>(),
        );
        let insns = self.func.block_insns(block);
        let mut e = self
            .edits
            .partition_point(|&(p, _)| p < ProgPoint::before(insns.first()));
        for inst in insns.iter() {
            while e < self.edits.len() && self.edits[e].0 <= ProgPoint::before(inst) {
                log::info!("    edit: {:?}", self.edits[e].1);
                e += 1;
            }
            let ops = self.func.inst_operands(inst);
            let offset = self.inst_alloc_offsets[inst.index()] as usize;
            let mut s = format!("    inst{}:", inst.index());
            for (i, op) in ops.iter().enumerate() {
                s += &format!(" {}={}", op, self.allocs[offset + i]);
            }
            log::info!("{}", s);
        }
    }
}
